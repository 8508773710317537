//! Marshaling between the data model and relational rows.
//!
//! Rows are produced with serde so that adding a field to `Cluster` only
//! needs a matching column in [`crate::schema`].

use crate::db::Row;
use crate::schema::{AWS_CLUSTERS, CLUSTERS, DOMAINS};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_schema::{AwsCluster, Cluster, ClusterState, Credential, Domain};

#[derive(Debug, Serialize, Deserialize)]
struct AwsClusterRow {
    cluster_id: String,
    region: String,
    instance_type: String,
    stack_name: String,
    stack_id: Option<String>,
    image_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DomainRow {
    cluster_id: String,
    name: String,
    token: String,
}

fn to_row<T: Serialize>(value: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Schema(format!(
            "expected an object to marshal, got {other}"
        ))),
    }
}

fn corrupt(table: &str, err: &serde_json::Error) -> StoreError {
    StoreError::CorruptRow {
        table: table.to_owned(),
        reason: err.to_string(),
    }
}

/// The generic columns of a cluster. The domain lives in its own table.
pub fn cluster_row(cluster: &Cluster) -> Result<Row, StoreError> {
    let mut row = to_row(cluster)?;
    row.remove("domain");
    Ok(row)
}

pub fn cluster_from_row(mut row: Row, domain: Option<Domain>) -> Result<Cluster, StoreError> {
    row.insert("domain".to_owned(), Value::Null);
    let mut cluster: Cluster =
        serde_json::from_value(Value::Object(row)).map_err(|e| corrupt(CLUSTERS.name, &e))?;
    cluster.domain = domain;
    Ok(cluster)
}

pub fn aws_cluster_row(aws: &AwsCluster) -> Result<Row, StoreError> {
    to_row(&AwsClusterRow {
        cluster_id: aws.cluster.id.to_string(),
        region: aws.region.clone(),
        instance_type: aws.instance_type.clone(),
        stack_name: aws.stack_name.clone(),
        stack_id: aws.stack_id.clone(),
        image_id: aws.image_id.clone(),
    })
}

pub fn aws_cluster_from_rows(cluster: Cluster, row: Row) -> Result<AwsCluster, StoreError> {
    let aws: AwsClusterRow =
        serde_json::from_value(Value::Object(row)).map_err(|e| corrupt(AWS_CLUSTERS.name, &e))?;
    if aws.cluster_id != cluster.id.as_str() {
        return Err(StoreError::CorruptRow {
            table: AWS_CLUSTERS.name.to_owned(),
            reason: format!(
                "row for '{}' joined to cluster '{}'",
                aws.cluster_id, cluster.id
            ),
        });
    }
    Ok(AwsCluster {
        cluster,
        region: aws.region,
        instance_type: aws.instance_type,
        stack_name: aws.stack_name,
        stack_id: aws.stack_id,
        image_id: aws.image_id,
    })
}

pub fn domain_row(cluster_id: &str, domain: &Domain) -> Result<Row, StoreError> {
    to_row(&DomainRow {
        cluster_id: cluster_id.to_owned(),
        name: domain.name.clone(),
        token: domain.token.clone(),
    })
}

pub fn domain_from_row(row: Row) -> Result<Domain, StoreError> {
    let d: DomainRow =
        serde_json::from_value(Value::Object(row)).map_err(|e| corrupt(DOMAINS.name, &e))?;
    Ok(Domain {
        name: d.name,
        token: d.token,
    })
}

pub fn credential_row(credential: &Credential) -> Result<Row, StoreError> {
    to_row(credential)
}

pub fn state_row(state: ClusterState) -> Row {
    let mut row = Row::new();
    row.insert("state".to_owned(), Value::String(state.as_str().to_owned()));
    row
}
