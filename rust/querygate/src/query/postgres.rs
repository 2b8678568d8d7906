//! PostgreSQL implementation of [`SqlBackend`] over a pooled `tokio_postgres::Client`.

use super::{
    backend::{
        collect_rows, unique_column_names, BackendError, ColumnInfo, Row, RowSet, SqlBackend,
    },
    binder::{BoundQuery, ParamValue},
};
use crate::db::ClientPool;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::{str::FromStr, time::Duration};
use tokio_postgres::types::{Kind, ToSql, Type};
use tracing::{debug, warn};
use uuid::Uuid;

static NAMED_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@(\w+)").expect("named marker pattern is valid"));

type SqlParam = Box<dyn ToSql + Sync + Send>;

#[derive(Clone)]
pub struct PgBackend {
    pool: ClientPool,
}

impl PgBackend {
    pub fn new(pool: ClientPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlBackend for PgBackend {
    async fn fetch(
        &self,
        query: &BoundQuery,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<RowSet, BackendError> {
        let (sql, order) = positional_sql(&query.sql);
        let values = order
            .iter()
            .map(|name| {
                query
                    .param(name)
                    .map(|value| (name.as_str(), value))
                    .ok_or_else(|| BackendError::MissingParameter(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let conn = self
            .pool
            .get()
            .await
            .map_err(|err| BackendError::Pool(format!("{err:?}")))?;

        conn.batch_execute(&format!(
            "SET statement_timeout = {}",
            timeout.as_millis().max(1)
        ))
        .await?;

        let statement = conn.prepare(&sql).await?;
        let keys = unique_column_names(statement.columns().iter().map(|column| column.name()));
        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .zip(&keys)
            .map(|(column, key)| ColumnInfo {
                name: key.clone(),
                data_type: column.type_().name().to_string(),
            })
            .collect();

        let params = values
            .iter()
            .zip(statement.params())
            .map(|((name, value), ty)| coerce_param(name, value, ty))
            .collect::<Result<Vec<SqlParam>, _>>()?;

        debug!(
            sql = %sql,
            params = params.len(),
            columns = columns.len(),
            "executing statement"
        );

        let stream = conn
            .query_raw(
                &statement,
                params.iter().map(|param| param.as_ref() as &(dyn ToSql + Sync)),
            )
            .await?;
        let decoded = stream.map(|row| {
            row.map_err(BackendError::from)
                .and_then(|row| decode_row(&row, &keys))
        });
        let (rows, truncated) = collect_rows(decoded, max_rows).await?;

        if truncated {
            warn!(max_rows, "result truncated at row cap");
        }

        Ok(RowSet {
            columns,
            rows,
            truncated,
        })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|err| BackendError::Pool(format!("{err:?}")))?;
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }
}

/// Rewrites `@name` markers to `$n`, numbering names by first appearance. Repeated names
/// share one positional slot.
pub(crate) fn positional_sql(sql: &str) -> (String, Vec<String>) {
    let mut order: Vec<String> = Vec::new();
    let rewritten = NAMED_MARKER.replace_all(sql, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        let index = match order
            .iter()
            .position(|seen| seen.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                order.push(name.to_string());
                order.len() - 1
            }
        };
        format!("${}", index + 1)
    });
    (rewritten.into_owned(), order)
}

fn coerce_param(name: &str, value: &ParamValue, ty: &Type) -> Result<SqlParam, BackendError> {
    if let Kind::Domain(base) = ty.kind() {
        return coerce_param(name, value, base);
    }

    let mismatch = |reason: String| BackendError::Parameter {
        name: name.to_string(),
        expected: ty.name().to_string(),
        reason,
    };

    let param: SqlParam = match ty.name() {
        "bool" => Box::new(as_bool(value).map_err(mismatch)?),
        "int2" => Box::new(narrow::<i16>(as_i64(value).map_err(&mismatch)?).map_err(mismatch)?),
        "int4" => Box::new(narrow::<i32>(as_i64(value).map_err(&mismatch)?).map_err(mismatch)?),
        "int8" => Box::new(as_i64(value).map_err(mismatch)?),
        "float4" => Box::new(as_f64(value).map_err(mismatch)?.map(|float| float as f32)),
        "float8" => Box::new(as_f64(value).map_err(mismatch)?),
        "numeric" => Box::new(as_decimal(value).map_err(mismatch)?),
        "json" | "jsonb" => Box::new(as_json(value)),
        "timestamptz" => Box::new(parse_text(value, parse_timestamptz).map_err(mismatch)?),
        "timestamp" => Box::new(parse_text(value, parse_timestamp).map_err(mismatch)?),
        "date" => Box::new(parse_text(value, |text| NaiveDate::from_str(text).ok()).map_err(mismatch)?),
        "uuid" => Box::new(parse_text(value, |text| Uuid::parse_str(text).ok()).map_err(mismatch)?),
        _ => Box::new(as_text(value)),
    };

    Ok(param)
}

fn as_bool(value: &ParamValue) -> Result<Option<bool>, String> {
    match value {
        ParamValue::Null => Ok(None),
        ParamValue::Bool(flag) => Ok(Some(*flag)),
        ParamValue::Int(int) => Ok(Some(*int != 0)),
        ParamValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(Some(true)),
            "false" | "f" | "0" | "no" => Ok(Some(false)),
            _ => Err(format!("'{text}' is not a boolean")),
        },
        ParamValue::Float(float) => Err(format!("{float} is not a boolean")),
    }
}

fn as_i64(value: &ParamValue) -> Result<Option<i64>, String> {
    match value {
        ParamValue::Null => Ok(None),
        ParamValue::Int(int) => Ok(Some(*int)),
        ParamValue::Bool(flag) => Ok(Some(i64::from(*flag))),
        ParamValue::Float(float) if float.fract() == 0.0 => Ok(Some(*float as i64)),
        ParamValue::Float(float) => Err(format!("{float} is not an integer")),
        ParamValue::Text(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("'{text}' is not an integer")),
    }
}

fn narrow<T: TryFrom<i64>>(value: Option<i64>) -> Result<Option<T>, String> {
    value
        .map(|int| T::try_from(int).map_err(|_| format!("{int} is out of range")))
        .transpose()
}

fn as_f64(value: &ParamValue) -> Result<Option<f64>, String> {
    match value {
        ParamValue::Null => Ok(None),
        ParamValue::Float(float) => Ok(Some(*float)),
        ParamValue::Int(int) => Ok(Some(*int as f64)),
        ParamValue::Bool(flag) => Err(format!("{flag} is not a number")),
        ParamValue::Text(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("'{text}' is not a number")),
    }
}

fn as_decimal(value: &ParamValue) -> Result<Option<Decimal>, String> {
    match value {
        ParamValue::Null => Ok(None),
        ParamValue::Int(int) => Ok(Some(Decimal::from(*int))),
        ParamValue::Float(float) => Decimal::try_from(*float)
            .map(Some)
            .map_err(|err| err.to_string()),
        ParamValue::Text(text) => Decimal::from_str(text.trim())
            .map(Some)
            .map_err(|_| format!("'{text}' is not a decimal")),
        ParamValue::Bool(flag) => Err(format!("{flag} is not a decimal")),
    }
}

fn as_json(value: &ParamValue) -> Option<Value> {
    match value {
        ParamValue::Null => None,
        ParamValue::Bool(flag) => Some(Value::Bool(*flag)),
        ParamValue::Int(int) => Some(Value::from(*int)),
        ParamValue::Float(float) => Some(Value::from(*float)),
        ParamValue::Text(text) => {
            Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone())))
        }
    }
}

fn as_text(value: &ParamValue) -> Option<String> {
    match value {
        ParamValue::Null => None,
        ParamValue::Text(text) => Some(text.clone()),
        ParamValue::Bool(flag) => Some(flag.to_string()),
        ParamValue::Int(int) => Some(int.to_string()),
        ParamValue::Float(float) => Some(float.to_string()),
    }
}

fn parse_text<T>(value: &ParamValue, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, String> {
    match value {
        ParamValue::Null => Ok(None),
        ParamValue::Text(text) => parse(text.trim())
            .map(Some)
            .ok_or_else(|| format!("cannot parse '{text}'")),
        other => Err(format!("{other} must be given as a string")),
    }
}

fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_timestamp(text).map(|naive| naive.and_utc()))
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::from_str(text)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.naive_utc())
        })
}

fn decode_row(row: &tokio_postgres::Row, keys: &[String]) -> Result<Row, BackendError> {
    let mut decoded = Row::with_capacity(keys.len());
    for ((idx, column), key) in row.columns().iter().enumerate().zip(keys) {
        let value = decode_column(row, idx, column.type_())?;
        decoded.insert(key.clone(), value);
    }
    Ok(decoded)
}

fn decode_column(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, BackendError> {
    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(Value::from),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        "oid" => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(|float| Value::from(f64::from(float))),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
        "numeric" => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(|decimal| Value::String(decimal.normalize().to_string())),
        "json" | "jsonb" => row.try_get::<_, Option<Value>>(idx)?,
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|ts| Value::String(ts.to_rfc3339())),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|date| Value::String(date.to_string())),
        "uuid" => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map(|uuid| Value::String(uuid.to_string())),
        "text" | "varchar" | "bpchar" | "name" | "citext" | "char" => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        other => match row.try_get::<_, Option<String>>(idx) {
            Ok(text) => text.map(Value::String),
            Err(_) => {
                debug!(column_type = other, "unsupported column type decoded as null");
                None
            }
        },
    };
    Ok(value.unwrap_or(Value::Null))
}
