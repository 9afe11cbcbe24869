//! ENVKEY credential parsing.

use std::str::FromStr;

use crate::error::Error;

/// A parsed ENVKEY credential.
///
/// Lexical form is at least two `-`-separated segments: the public id part,
/// the symmetric password used to unwrap the private key, and optionally a
/// host override (remaining segments rejoined with `-`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envkey {
    pub id_part: String,
    pub password: String,
    pub host: Option<String>,
}

impl FromStr for Envkey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.splitn(3, '-');
        let id_part = segments.next().unwrap_or_default();
        let password = segments.next().ok_or(Error::EnvkeyInvalid)?;

        if id_part.is_empty() || password.is_empty() {
            return Err(Error::EnvkeyInvalid);
        }

        Ok(Envkey {
            id_part: id_part.to_string(),
            password: password.to_string(),
            host: segments.next().map(str::to_string),
        })
    }
}

impl Envkey {
    /// The host this credential fetches from, falling back to the default.
    pub fn host_or_default(&self) -> &str {
        self.host
            .as_deref()
            .unwrap_or(crate::defaults::DEFAULT_HOST)
    }
}

/// The public id segment of a raw ENVKEY string, safe to log.
pub fn id_part(envkey: &str) -> &str {
    envkey.split('-').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_segment_envkey() {
        let parsed: Envkey = "ekAc3fZk7zsqSizX9yen-9SZSJSADXAV2dcPTvrnz".parse().unwrap();
        assert_eq!(parsed.id_part, "ekAc3fZk7zsqSizX9yen");
        assert_eq!(parsed.password, "9SZSJSADXAV2dcPTvrnz");
        assert_eq!(parsed.host, None);
        assert_eq!(parsed.host_or_default(), "api-v2.envkey.com");
    }

    #[test]
    fn test_host_override_rejoins_dashes() {
        let parsed: Envkey = "id-pw-self-hosted.example.com".parse().unwrap();
        assert_eq!(parsed.host.as_deref(), Some("self-hosted.example.com"));
        assert_eq!(parsed.host_or_default(), "self-hosted.example.com");
    }

    #[test]
    fn test_single_segment_is_invalid() {
        let result = "justonepart".parse::<Envkey>();
        assert!(matches!(result, Err(Error::EnvkeyInvalid)));
    }

    #[test]
    fn test_empty_segments_are_invalid() {
        assert!("-pw".parse::<Envkey>().is_err());
        assert!("id-".parse::<Envkey>().is_err());
        assert!("".parse::<Envkey>().is_err());
    }

    #[test]
    fn test_id_part_helper() {
        assert_eq!(id_part("abc-def-ghi"), "abc");
        assert_eq!(id_part("abc"), "abc");
        assert_eq!(id_part(""), "");
    }
}
