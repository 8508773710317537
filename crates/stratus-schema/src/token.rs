use crate::types::ClusterId;

/// Generate an unguessable hex token of `len` characters (at most 64).
///
/// Entropy comes from a v4 UUID, whitened through blake3.
pub fn generate_token(len: usize) -> String {
    let seed = uuid::Uuid::new_v4();
    let hex = blake3::hash(seed.as_bytes()).to_hex();
    hex[..len.min(hex.len())].to_owned()
}

pub fn generate_cluster_id() -> ClusterId {
    ClusterId::new(format!("stratus-{}", generate_token(12)))
}
