use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "GCP_PROJECT_ID")]
    pub project_id: String,

    #[envconfig(from = "SUBSCRIPTION_ID")]
    pub subscription_id: String,

    /// Base URL of the Pub/Sub-compatible REST endpoint. Overridable to
    /// point at an emulator in development.
    #[envconfig(from = "PUBSUB_ENDPOINT", default = "https://pubsub.googleapis.com")]
    pub pubsub_endpoint: String,

    /// Base URL of the object storage REST endpoint.
    #[envconfig(from = "STORAGE_ENDPOINT", default = "https://storage.googleapis.com")]
    pub storage_endpoint: String,

    /// Bearer token presented to both GCP endpoints. Credential refresh is
    /// handled outside this process.
    #[envconfig(from = "GCP_ACCESS_TOKEN", default = "")]
    pub access_token: String,

    #[envconfig(from = "BUCKET_NAME")]
    pub bucket_name: String,

    #[envconfig(from = "MAX_MESSAGES", default = "10")]
    pub max_messages: i32,

    /// Server-side timeout for the blocking pull call.
    #[envconfig(from = "PULL_TIMEOUT_SECS", default = "90")]
    pub pull_timeout: EnvSecsDuration,

    /// Pause between pull cycles, also applied after a pull error.
    #[envconfig(from = "POLL_INTERVAL_SECS", default = "1")]
    pub poll_interval: EnvSecsDuration,

    /// How long a message fingerprint suppresses reprocessing. The purge
    /// task runs on the same period, bounding the cache at roughly two
    /// windows of traffic.
    #[envconfig(from = "DEDUP_EXPIRATION_HOURS", default = "1")]
    pub dedup_expiration_hours: u64,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dedup_expiration(&self) -> time::Duration {
        time::Duration::from_secs(self.dedup_expiration_hours * 60 * 60)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;

        Ok(EnvSecsDuration(time::Duration::from_secs(secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_secs_duration() {
        let parsed = "90".parse::<EnvSecsDuration>().unwrap();
        assert_eq!(parsed.0, time::Duration::from_secs(90));

        assert!("ninety".parse::<EnvSecsDuration>().is_err());
        assert!("".parse::<EnvSecsDuration>().is_err());
    }

    #[test]
    fn dedup_expiration_from_hours() {
        let mut env = std::collections::HashMap::new();
        env.insert("GCP_PROJECT_ID".to_owned(), "test-project".to_owned());
        env.insert("SUBSCRIPTION_ID".to_owned(), "test-sub".to_owned());
        env.insert("BUCKET_NAME".to_owned(), "test-bucket".to_owned());
        env.insert(
            "DATABASE_URL".to_owned(),
            "postgres://localhost/test".to_owned(),
        );
        env.insert("DEDUP_EXPIRATION_HOURS".to_owned(), "7".to_owned());

        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(
            config.dedup_expiration(),
            time::Duration::from_secs(7 * 60 * 60)
        );
        assert_eq!(config.bind(), "0.0.0.0:8080");
    }
}
