use crate::aws::AwsLaunchRequest;
use crate::cluster::ClusterType;
use crate::SchemaError;

/// A request to launch a cluster, one variant per supported provider.
///
/// Adding a provider adds a variant here; dispatch is by variant, never by
/// inspecting fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRequest {
    Aws(AwsLaunchRequest),
}

impl LaunchRequest {
    pub fn cluster_type(&self) -> ClusterType {
        match self {
            LaunchRequest::Aws(_) => ClusterType::Aws,
        }
    }

    /// Decode a request tagged with a `"type"` field, e.g.
    /// `{"type": "aws", "credential_id": "..."}`.
    ///
    /// An unrecognized tag is reported as [`SchemaError::UnsupportedType`]
    /// rather than a parse failure.
    pub fn from_json(input: &str) -> Result<Self, SchemaError> {
        let mut value: serde_json::Value = serde_json::from_str(input)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| SchemaError::InvalidField {
                field: "request",
                reason: "expected a JSON object".to_owned(),
            })?;
        let tag = match obj.remove("type") {
            Some(serde_json::Value::String(tag)) => tag,
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    field: "type",
                    reason: format!("expected a string, got {other}"),
                })
            }
            None => return Err(SchemaError::MissingField("type")),
        };

        match tag.parse::<ClusterType>()? {
            ClusterType::Aws => Ok(LaunchRequest::Aws(serde_json::from_value(value)?)),
        }
    }
}

impl From<AwsLaunchRequest> for LaunchRequest {
    fn from(req: AwsLaunchRequest) -> Self {
        LaunchRequest::Aws(req)
    }
}
