use std::path::PathBuf;

use sharescope_core::config::{ConfigStatus, MapperConfig};
use sharescope_core::remote::AccessToken;
use sharescope_core::{Error, Result};

pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Clone)]
pub struct Settings {
    pub account: Option<String>,
    pub token: Option<AccessToken>,
    pub db_path: PathBuf,
    pub remap: bool,
    pub port: u16,
    pub mapper: MapperConfig,
}

impl Settings {
    /// Environment first, then command line flags on top.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        Self::from_parts(args, |key| std::env::var(key).ok())
    }

    pub fn from_parts<I, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings {
            account: env("SHARESCOPE_ACCOUNT").filter(|v| !v.trim().is_empty()),
            token: env("SHARESCOPE_ACCESS_TOKEN").and_then(AccessToken::new),
            db_path: env("SHARESCOPE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            remap: false,
            port: DEFAULT_PORT,
            mapper: MapperConfig::from_lookup(&env),
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--account" => settings.account = Some(value(&arg, args.next())?),
                "--token" => {
                    settings.token = AccessToken::new(value(&arg, args.next())?);
                }
                "--db" => settings.db_path = PathBuf::from(value(&arg, args.next())?),
                "--remap" => settings.remap = true,
                "--port" => settings.port = number(&arg, args.next())?,
                "--max-records" => settings.mapper.max_records = positive(&arg, args.next())?,
                "--batch-size" => settings.mapper.batch_size = positive(&arg, args.next())?,
                _ => {
                    return Err(Error::InvalidArgument(format!("unknown arg: {arg}")));
                }
            }
        }

        Ok(settings)
    }

    pub fn require_account(&self) -> Result<&str> {
        self.account.as_deref().ok_or_else(|| {
            Error::InvalidArgument("missing --account <key> (or SHARESCOPE_ACCOUNT)".to_string())
        })
    }

    pub fn status(&self) -> ConfigStatus {
        ConfigStatus {
            has_token: self.token.is_some(),
            has_account: self.account.is_some(),
        }
    }
}

fn value(flag: &str, next: Option<String>) -> Result<String> {
    next.filter(|v| !v.starts_with("--"))
        .ok_or_else(|| Error::InvalidArgument(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(flag: &str, next: Option<String>) -> Result<T> {
    let raw = value(flag, next)?;
    raw.parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid value for {flag}: {raw}")))
}

fn positive<T>(flag: &str, next: Option<String>) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let n: T = number(flag, next)?;
    if n > T::default() {
        Ok(n)
    } else {
        Err(Error::InvalidArgument(format!("{flag} must be greater than zero")))
    }
}

pub fn default_db_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("sharescope");
    path.push("snapshots.db");
    path
}
