use crate::CredentialError;
use std::fmt;
use std::sync::Arc;
use stratus_schema::CredentialId;

const ACCESS_KEY_VARS: [&str; 2] = ["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"];
const SECRET_KEY_VARS: [&str; 2] = ["AWS_SECRET_ACCESS_KEY", "AWS_SECRET_KEY"];

/// Cloud credentials handed to a provider.
///
/// A stored credential's id doubles as its access key id.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Environment {
        access_key_id: String,
        secret: String,
    },
    Stored {
        id: CredentialId,
        secret: String,
    },
}

impl Credentials {
    pub fn access_key_id(&self) -> &str {
        match self {
            Credentials::Environment { access_key_id, .. } => access_key_id,
            Credentials::Stored { id, .. } => id.as_str(),
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credentials::Environment { secret, .. } | Credentials::Stored { secret, .. } => secret,
        }
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, Credentials::Environment { .. })
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = if self.is_environment() {
            "Environment"
        } else {
            "Stored"
        };
        f.debug_struct(source)
            .field("access_key_id", &self.access_key_id())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Zero-argument factory for the reserved environment credential.
pub type EnvCredentialSource = Arc<dyn Fn() -> Result<Credentials, CredentialError> + Send + Sync>;

/// Resolve credentials through `lookup`, trying the standard variable names
/// before the legacy ones.
pub fn credentials_from(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credentials, CredentialError> {
    let first_set = |names: [&'static str; 2]| {
        names
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.is_empty()))
            .ok_or(CredentialError::MissingEnv(names[0]))
    };
    Ok(Credentials::Environment {
        access_key_id: first_set(ACCESS_KEY_VARS)?,
        secret: first_set(SECRET_KEY_VARS)?,
    })
}

/// Read AWS credentials from the process environment.
pub fn env_credentials() -> Result<Credentials, CredentialError> {
    credentials_from(|name| std::env::var(name).ok())
}

pub fn env_credential_source() -> EnvCredentialSource {
    Arc::new(env_credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn standard_names_win() {
        let creds = credentials_from(lookup(&[
            ("AWS_ACCESS_KEY_ID", "AKIA1"),
            ("AWS_ACCESS_KEY", "AKIA2"),
            ("AWS_SECRET_ACCESS_KEY", "s1"),
        ]))
        .unwrap();
        assert_eq!(creds.access_key_id(), "AKIA1");
        assert_eq!(creds.secret(), "s1");
        assert!(creds.is_environment());
    }

    #[test]
    fn legacy_names_are_a_fallback() {
        let creds = credentials_from(lookup(&[
            ("AWS_ACCESS_KEY", "AKIA2"),
            ("AWS_SECRET_KEY", "s2"),
        ]))
        .unwrap();
        assert_eq!(creds.access_key_id(), "AKIA2");
        assert_eq!(creds.secret(), "s2");
    }

    #[test]
    fn missing_secret_reported() {
        let err = credentials_from(lookup(&[("AWS_ACCESS_KEY_ID", "AKIA1")])).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::MissingEnv("AWS_SECRET_ACCESS_KEY")
        ));
    }

    #[test]
    fn empty_values_do_not_count() {
        let err = credentials_from(lookup(&[
            ("AWS_ACCESS_KEY_ID", ""),
            ("AWS_SECRET_ACCESS_KEY", "s"),
        ]))
        .unwrap_err();
        assert!(matches!(err, CredentialError::MissingEnv("AWS_ACCESS_KEY_ID")));
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = Credentials::Stored {
            id: CredentialId::new("AKIA9"),
            secret: "hunter2".to_owned(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("AKIA9"));
        assert!(!shown.contains("hunter2"));
    }
}
