//! Command line arguments shared by both binaries.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser};
use secrecy::SecretString;

use kafka_mtls_core::{ClientConfig, SecurityProtocol, StoreType, TlsConfig};

/// Exit code for a malformed command line.
pub const USAGE_EXIT_CODE: i32 = 1;

/// Connection and credential arguments common to the producer and consumer.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Comma-separated bootstrap servers (host:port,host:port).
    pub brokers: String,

    /// Topic to produce to or consume from.
    pub topic: String,

    /// Client keystore holding this client's certificate and private key.
    pub keystore: PathBuf,

    /// Truststore holding the CA that signed the broker certificates.
    #[arg(long, env = "KAFKA_TRUSTSTORE")]
    pub truststore: Option<PathBuf>,

    /// Keystore format: PKCS12 or PEM. Defaults to the config file's
    /// setting, then PKCS12.
    #[arg(long)]
    pub keystore_type: Option<StoreType>,

    /// Truststore format: PKCS12 or PEM. Defaults to the config file's
    /// setting, then PKCS12.
    #[arg(long)]
    pub truststore_type: Option<StoreType>,

    /// Keystore password.
    #[arg(long, env = "KAFKA_KEYSTORE_PASSWORD", hide_env_values = true)]
    pub keystore_password: Option<String>,

    /// Private key password, when it differs from the keystore password.
    #[arg(long, env = "KAFKA_KEY_PASSWORD", hide_env_values = true)]
    pub key_password: Option<String>,

    /// Truststore password.
    #[arg(long, env = "KAFKA_TRUSTSTORE_PASSWORD", hide_env_values = true)]
    pub truststore_password: Option<String>,

    /// YAML file with the remaining client settings.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl CommonArgs {
    /// Bootstrap servers from the comma-separated positional argument.
    ///
    /// # Errors
    ///
    /// Fails when the list holds no server.
    pub fn bootstrap_servers(&self) -> anyhow::Result<Vec<String>> {
        let servers: Vec<String> = self
            .brokers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            bail!("no bootstrap servers in '{}'", self.brokers);
        }
        Ok(servers)
    }

    /// Client configuration: the `--config` file (or defaults) with the
    /// command line's brokers and credentials applied over it.
    ///
    /// Passwords and store types given on the command line or in the
    /// environment take precedence over those in the file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be loaded, no truststore is given, or the
    /// result does not validate.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let servers = self.bootstrap_servers()?;
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ClientConfig::new(servers.clone()),
        };
        config.kafka.bootstrap_servers = servers;

        let file_tls = config.tls.take();
        let truststore_path = self
            .truststore
            .clone()
            .or_else(|| file_tls.as_ref().map(|tls| tls.truststore_path.clone()))
            .context("a truststore is required (--truststore or KAFKA_TRUSTSTORE)")?;

        let secret = |arg: &Option<String>, fallback: Option<&SecretString>| {
            arg.clone()
                .map(SecretString::from)
                .or_else(|| fallback.cloned())
        };
        config.tls = Some(TlsConfig {
            keystore_path: self.keystore.clone(),
            keystore_type: self
                .keystore_type
                .or_else(|| file_tls.as_ref().map(|t| t.keystore_type))
                .unwrap_or(StoreType::Pkcs12),
            keystore_password: secret(
                &self.keystore_password,
                file_tls.as_ref().and_then(|t| t.keystore_password.as_ref()),
            ),
            key_password: secret(
                &self.key_password,
                file_tls.as_ref().and_then(|t| t.key_password.as_ref()),
            ),
            truststore_path,
            truststore_type: self
                .truststore_type
                .or_else(|| file_tls.as_ref().map(|t| t.truststore_type))
                .unwrap_or(StoreType::Pkcs12),
            truststore_password: secret(
                &self.truststore_password,
                file_tls.as_ref().and_then(|t| t.truststore_password.as_ref()),
            ),
        });
        config.kafka.security_protocol = SecurityProtocol::Ssl;

        config.validate()?;
        Ok(config)
    }
}

/// Parse the command line, printing usage and exiting with
/// [`USAGE_EXIT_CODE`] when it is malformed. `--help` and `--version` exit 0.
#[must_use]
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(USAGE_EXIT_CODE);
        }
        Err(e) => e.exit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[derive(Debug, Parser)]
    struct TestArgs {
        #[command(flatten)]
        common: CommonArgs,
    }

    fn parse(args: &[&str]) -> Result<TestArgs, clap::Error> {
        TestArgs::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
    }

    #[test]
    fn test_three_positionals_required() {
        assert!(parse(&["localhost:9093", "orders"]).is_err());
        assert!(parse(&["localhost:9093", "orders", "client.p12", "extra"]).is_err());
        assert!(parse(&["localhost:9093", "orders", "client.p12"]).is_ok());
    }

    #[test]
    fn test_bootstrap_list_split() {
        let args = parse(&["a:9093, b:9093,,", "orders", "client.p12"]).unwrap();
        assert_eq!(
            args.common.bootstrap_servers().unwrap(),
            vec!["a:9093".to_string(), "b:9093".to_string()]
        );

        let args = parse(&[",", "orders", "client.p12"]).unwrap();
        assert!(args.common.bootstrap_servers().is_err());
    }

    #[test]
    fn test_client_config_from_flags() {
        let args = parse(&[
            "broker-1:9093,broker-2:9093",
            "orders",
            "client.pem",
            "--keystore-type",
            "pem",
            "--truststore",
            "ca.p12",
            "--truststore-password",
            "ts-secret",
        ])
        .unwrap();

        let config = args.common.client_config().unwrap();
        assert_eq!(config.kafka.bootstrap_servers.len(), 2);
        assert_eq!(config.kafka.security_protocol, SecurityProtocol::Ssl);

        let tls = config.tls.unwrap();
        assert_eq!(tls.keystore_type, StoreType::Pem);
        assert_eq!(tls.truststore_type, StoreType::Pkcs12);
        assert_eq!(tls.truststore_path, PathBuf::from("ca.p12"));
        assert_eq!(
            tls.truststore_password.unwrap().expose_secret(),
            "ts-secret"
        );
    }

    #[test]
    fn test_command_line_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
kafka:
  bootstrap_servers: ["ignored:9093"]
  client_id: from-file
tls:
  keystore_path: file-keystore.p12
  keystore_password: file-ks-secret
  truststore_path: file-truststore.p12
consumer:
  group_id: file-group
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let args = parse(&["broker:9093", "orders", "client.p12", "--config", path]).unwrap();
        let config = args.common.client_config().unwrap();

        assert_eq!(config.kafka.bootstrap_servers, vec!["broker:9093".to_string()]);
        assert_eq!(config.kafka.client_id, "from-file");
        assert_eq!(config.consumer.group_id, "file-group");

        let tls = config.tls.unwrap();
        assert_eq!(tls.keystore_path, PathBuf::from("client.p12"));
        assert_eq!(tls.truststore_path, PathBuf::from("file-truststore.p12"));
        assert_eq!(
            tls.keystore_password.unwrap().expose_secret(),
            "file-ks-secret"
        );
    }

    #[test]
    fn test_store_types_fall_back_to_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
kafka:
  bootstrap_servers: ["ignored:9093"]
tls:
  keystore_path: client.pem
  keystore_type: PEM
  truststore_path: ca.pem
  truststore_type: PEM
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let args = parse(&["broker:9093", "orders", "client.pem", "--config", path]).unwrap();
        let tls = args.common.client_config().unwrap().tls.unwrap();
        assert_eq!(tls.keystore_type, StoreType::Pem);
        assert_eq!(tls.truststore_type, StoreType::Pem);

        let args = parse(&[
            "broker:9093",
            "orders",
            "client.p12",
            "--config",
            path,
            "--keystore-type",
            "PKCS12",
        ])
        .unwrap();
        let tls = args.common.client_config().unwrap().tls.unwrap();
        assert_eq!(tls.keystore_type, StoreType::Pkcs12);
        assert_eq!(tls.truststore_type, StoreType::Pem);
    }

    #[test]
    fn test_missing_truststore_rejected() {
        let args = parse(&["broker:9093", "orders", "client.p12"]).unwrap();
        if args.common.truststore.is_none() {
            assert!(args.common.client_config().is_err());
        }
    }
}
