//! Diesel schema definitions for the template metadata store.

diesel::table! {
    use diesel::sql_types::*;

    query_templates (id_query_template) {
        id_query_template -> Int4,
        name -> Varchar,
        description -> Nullable<Text>,
        category -> Nullable<Varchar>,
        query_sql -> Text,
        params -> Jsonb,
        output_format -> Varchar,
        max_results -> Int4,
        timeout_seconds -> Int4,
        version -> Int4,
        creation_date -> Timestamptz,
        update_date -> Nullable<Timestamptz>,
        active -> Bool,
        deprecated -> Bool,
        deprecation_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    query_tags (id_query_query_tag) {
        id_query_query_tag -> Int4,
        id_query_template -> Int4,
        version -> Int4,
        query_sql -> Text,
        params -> Nullable<Jsonb>,
        name -> Nullable<Varchar>,
        description -> Nullable<Text>,
        creation_date -> Timestamptz,
        change_reason -> Nullable<Text>,
        change_type -> Nullable<Varchar>,
        sql_diff -> Nullable<Text>,
    }
}

diesel::joinable!(query_tags -> query_templates (id_query_template));
diesel::allow_tables_to_appear_in_same_query!(query_templates, query_tags);
