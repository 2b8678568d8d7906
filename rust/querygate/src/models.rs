//! Row models for the template store and the cached container records.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Stored, versioned query definition.
#[derive(
    Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = crate::schema::query_templates)]
#[diesel(primary_key(id))]
#[diesel(treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct QueryTemplate {
    #[diesel(column_name = id_query_template)]
    #[serde(rename = "idQueryTemplate")]
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub query_sql: String,
    pub params: Value,
    pub output_format: String,
    pub max_results: i32,
    pub timeout_seconds: i32,
    pub version: i32,
    pub creation_date: DateTime<Utc>,
    pub update_date: Option<DateTime<Utc>>,
    pub active: bool,
    pub deprecated: bool,
    pub deprecation_date: Option<DateTime<Utc>>,
}

impl QueryTemplate {
    /// Eligible for execution by name.
    pub fn is_executable(&self) -> bool {
        self.active && !self.deprecated
    }

    pub fn summary(&self, tag_count: i64) -> TemplateSummary {
        TemplateSummary {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            output_format: self.output_format.clone(),
            max_results: self.max_results,
            timeout_seconds: self.timeout_seconds,
            version: self.version,
            active: self.active,
            deprecated: self.deprecated,
            creation_date: self.creation_date,
            update_date: self.update_date,
            tag_count,
        }
    }
}

/// Listing view of a template: everything but the SQL and parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    #[serde(rename = "idQueryTemplate")]
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub output_format: String,
    pub max_results: i32,
    pub timeout_seconds: i32,
    pub version: i32,
    pub active: bool,
    pub deprecated: bool,
    pub creation_date: DateTime<Utc>,
    pub update_date: Option<DateTime<Utc>>,
    pub tag_count: i64,
}

/// Immutable snapshot of a template at tagging time.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::query_tags)]
#[serde(rename_all = "camelCase")]
pub struct QueryTag {
    #[diesel(column_name = id_query_query_tag)]
    #[serde(rename = "idQueryQueryTag")]
    pub id: i32,
    #[diesel(column_name = id_query_template)]
    #[serde(rename = "idQueryTemplate")]
    pub template_id: i32,
    pub version: i32,
    pub query_sql: String,
    pub params: Option<Value>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub change_reason: Option<String>,
    pub change_type: Option<String>,
    pub sql_diff: Option<String>,
}

impl QueryTag {
    pub fn summary(&self) -> TagSummary {
        TagSummary {
            id: self.id,
            template_id: self.template_id,
            version: self.version,
            change_reason: self.change_reason.clone(),
            change_type: self.change_type.clone(),
            creation_date: self.creation_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSummary {
    #[serde(rename = "idQueryQueryTag")]
    pub id: i32,
    #[serde(rename = "idQueryTemplate")]
    pub template_id: i32,
    pub version: i32,
    pub change_reason: Option<String>,
    pub change_type: Option<String>,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Minor,
    Major,
    Bugfix,
    Rollback,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Minor => "minor",
            ChangeType::Major => "major",
            ChangeType::Bugfix => "bugfix",
            ChangeType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(ChangeType::Minor),
            "major" => Ok(ChangeType::Major),
            "bugfix" => Ok(ChangeType::Bugfix),
            "rollback" => Ok(ChangeType::Rollback),
            other => Err(format!(
                "unsupported change type '{other}' (expected minor, major, bugfix or rollback)"
            )),
        }
    }
}

/// Container row mirrored into the cache. JSON keys match what cache readers expect;
/// nulls are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: i64,
    #[serde(rename = "cassa")]
    pub code: Option<String>,
    #[serde(rename = "descrizione")]
    pub description: Option<String>,
    #[serde(rename = "piantoni")]
    pub stanchions: Option<i32>,
    #[serde(rename = "tipo")]
    pub kind: Option<String>,
    #[serde(rename = "nota")]
    pub note: Option<String>,
    #[serde(rename = "container")]
    pub is_container: Option<bool>,
    #[serde(rename = "mobile")]
    pub is_mobile: Option<bool>,
    #[serde(rename = "rottami")]
    pub for_scrap: Option<bool>,
    #[serde(rename = "larghezza")]
    pub width: Option<i32>,
    #[serde(rename = "altezza")]
    pub height: Option<i32>,
    #[serde(rename = "lunghezza")]
    pub length: Option<i32>,
    pub volume: Option<i32>,
    #[serde(rename = "manutenzione")]
    pub maintenance: Option<String>,
    #[serde(rename = "modello")]
    pub model: Option<String>,
    #[serde(rename = "numserie")]
    pub serial_number: Option<String>,
    #[serde(rename = "controllock")]
    pub control_lock: Option<String>,
    #[serde(rename = "portatakg")]
    pub capacity_kg: Option<i32>,
    #[serde(rename = "sponda")]
    pub tail_lift: Option<bool>,
    #[serde(rename = "gru")]
    pub crane: Option<bool>,
    #[serde(rename = "carrelli")]
    pub trolleys: Option<bool>,
    #[serde(rename = "transpallet")]
    pub pallet_truck: Option<bool>,
    #[serde(rename = "pesaAPonte")]
    pub weighbridge: Option<bool>,
    #[serde(rename = "targa")]
    pub plate: Option<String>,
    #[serde(rename = "assali")]
    pub axles: Option<bool>,
    #[serde(rename = "pneumatici")]
    pub tyres: Option<bool>,
    #[serde(rename = "ck")]
    pub checked: Option<bool>,
    #[serde(rename = "ckData")]
    pub check_date: Option<String>,
    #[serde(rename = "giorniPre")]
    pub notice_days: Option<i32>,
    #[serde(rename = "tara")]
    pub tare: Option<i32>,
    #[serde(rename = "identificativo")]
    pub identifier: Option<String>,
    #[serde(rename = "foto")]
    pub photo: Option<String>,
    #[serde(rename = "id_tfp")]
    pub external_id: Option<String>,
}

impl ContainerRecord {
    /// Sorted-index member: upper-cased code (empty when absent), a colon, the id.
    pub fn index_member(&self) -> String {
        format!(
            "{}:{}",
            self.code.as_deref().unwrap_or_default().to_uppercase(),
            self.id
        )
    }
}
