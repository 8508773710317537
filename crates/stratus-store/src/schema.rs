//! Relational table definitions.

use crate::db::Row;
use crate::StoreError;

/// Static description of a table: its name, primary key column, the full
/// column list in declaration order, and the DDL that creates it. Rows are
/// checked against this before they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
    pub create: &'static str,
}

pub const CLUSTERS: TableDef = TableDef {
    name: "clusters",
    primary_key: "id",
    columns: &[
        "id",
        "credential_id",
        "type",
        "state",
        "num_instances",
        "controller_key",
        "controller_pin",
        "dashboard_login_token",
        "ca_cert",
        "ssh_key_name",
        "vpc_cidr",
        "subnet_cidr",
        "discovery_token",
        "dns_zone_id",
    ],
    create: "CREATE TABLE IF NOT EXISTS clusters (
        id                    TEXT PRIMARY KEY NOT NULL,
        credential_id         TEXT,
        type                  TEXT NOT NULL,
        state                 TEXT NOT NULL,
        num_instances         INTEGER,
        controller_key        TEXT,
        controller_pin        TEXT,
        dashboard_login_token TEXT,
        ca_cert               TEXT,
        ssh_key_name          TEXT,
        vpc_cidr              TEXT,
        subnet_cidr           TEXT,
        discovery_token       TEXT,
        dns_zone_id           TEXT
    )",
};

pub const AWS_CLUSTERS: TableDef = TableDef {
    name: "aws_clusters",
    primary_key: "cluster_id",
    columns: &[
        "cluster_id",
        "region",
        "instance_type",
        "stack_name",
        "stack_id",
        "image_id",
    ],
    create: "CREATE TABLE IF NOT EXISTS aws_clusters (
        cluster_id    TEXT PRIMARY KEY NOT NULL REFERENCES clusters (id),
        region        TEXT,
        instance_type TEXT,
        stack_name    TEXT,
        stack_id      TEXT,
        image_id      TEXT
    )",
};

/// At most one domain per cluster, hence keyed by cluster id.
pub const DOMAINS: TableDef = TableDef {
    name: "domains",
    primary_key: "cluster_id",
    columns: &["cluster_id", "name", "token"],
    create: "CREATE TABLE IF NOT EXISTS domains (
        cluster_id TEXT PRIMARY KEY NOT NULL REFERENCES clusters (id),
        name       TEXT NOT NULL,
        token      TEXT
    )",
};

pub const CREDENTIALS: TableDef = TableDef {
    name: "credentials",
    primary_key: "id",
    columns: &["id", "secret"],
    create: "CREATE TABLE IF NOT EXISTS credentials (
        id     TEXT PRIMARY KEY NOT NULL,
        secret TEXT NOT NULL
    )",
};

pub const TABLES: &[TableDef] = &[CLUSTERS, AWS_CLUSTERS, DOMAINS, CREDENTIALS];

pub fn table_def(name: &str) -> Result<&'static TableDef, StoreError> {
    TABLES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| StoreError::Schema(format!("no such table '{name}'")))
}

impl TableDef {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| *c == column)
    }

    /// Check `row` against the column list and return its primary key.
    /// Absent non-key columns are filled with `null`.
    pub fn normalize_row(&self, row: &mut Row) -> Result<String, StoreError> {
        if let Some(unknown) = row.keys().find(|k| !self.has_column(k)) {
            return Err(StoreError::Schema(format!(
                "table '{}' has no column '{unknown}'",
                self.name
            )));
        }
        let key = self.key_of(row)?;
        for column in self.columns {
            row.entry((*column).to_owned())
                .or_insert(serde_json::Value::Null);
        }
        Ok(key)
    }

    pub fn key_of(&self, row: &Row) -> Result<String, StoreError> {
        match row.get(self.primary_key) {
            Some(serde_json::Value::String(key)) if !key.is_empty() => Ok(key.clone()),
            _ => Err(StoreError::Schema(format!(
                "table '{}' requires a non-empty string '{}'",
                self.name, self.primary_key
            ))),
        }
    }

    /// Reject `set` clauses that touch unknown columns or the primary key.
    pub fn check_update(&self, set: &Row) -> Result<(), StoreError> {
        for column in set.keys() {
            if !self.has_column(column) {
                return Err(StoreError::Schema(format!(
                    "table '{}' has no column '{column}'",
                    self.name
                )));
            }
            if column == self.primary_key {
                return Err(StoreError::Schema(format!(
                    "primary key '{column}' of '{}' is immutable",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn lookup_known_tables() {
        assert_eq!(table_def("clusters").unwrap().primary_key, "id");
        assert_eq!(table_def("domains").unwrap().primary_key, "cluster_id");
        assert!(table_def("gce_clusters").is_err());
    }

    #[test]
    fn normalize_fills_missing_columns() {
        let mut r = row(json!({"id": "k", "secret": "s"}));
        assert_eq!(CREDENTIALS.normalize_row(&mut r).unwrap(), "k");

        let mut r = row(json!({"cluster_id": "c1", "name": "d.example"}));
        DOMAINS.normalize_row(&mut r).unwrap();
        assert_eq!(r["token"], serde_json::Value::Null);
    }

    #[test]
    fn unknown_column_rejected() {
        let mut r = row(json!({"id": "k", "secret": "s", "extra": 1}));
        assert!(matches!(
            CREDENTIALS.normalize_row(&mut r),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn missing_or_non_string_key_rejected() {
        let mut r = row(json!({"secret": "s"}));
        assert!(CREDENTIALS.normalize_row(&mut r).is_err());
        let mut r = row(json!({"id": 7, "secret": "s"}));
        assert!(CREDENTIALS.normalize_row(&mut r).is_err());
        let mut r = row(json!({"id": "", "secret": "s"}));
        assert!(CREDENTIALS.normalize_row(&mut r).is_err());
    }

    #[test]
    fn ddl_declares_every_column() {
        for def in TABLES {
            assert!(def.create.contains(&format!("TABLE IF NOT EXISTS {} (", def.name)));
            for column in def.columns {
                assert!(def.create.contains(column), "{} lacks {column}", def.name);
            }
            assert!(def
                .create
                .contains(&format!("{} ", def.primary_key)));
        }
    }

    #[test]
    fn update_cannot_touch_primary_key() {
        assert!(CLUSTERS.check_update(&row(json!({"state": "ready"}))).is_ok());
        assert!(CLUSTERS.check_update(&row(json!({"id": "other"}))).is_err());
        assert!(CLUSTERS.check_update(&row(json!({"colour": "x"}))).is_err());
    }
}
