use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Static configuration for one accept-filter instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether this listener fronts the ingress side of the workload.
    /// Ingress treats the destination as the pod; egress the source.
    pub is_ingress: bool,

    /// Permits preserving the downstream source address on the upstream
    /// leg when the destination is a remote cluster member.
    pub may_use_original_source_address: bool,

    /// Marks egress connections with the policy's endpoint id instead of
    /// the source identity. May not be combined with `is_ingress`.
    pub egress_mark_source_endpoint_id: bool,

    /// Suppresses connection marking entirely; used when a co-located
    /// enforcement point already tags traffic.
    pub no_local_enforcement: bool,

    /// Root under which the identity and conntrack tables are opened.
    /// `None` disables store-backed features.
    pub store_root: Option<PathBuf>,
}

/// Errors produced when loading or cross-checking a `Config`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidEnvVar,
    /// `egress_mark_source_endpoint_id` may not be set with ingress.
    ConflictingFlags,
    /// Filter instances in one process must name the same store root.
    InconsistentStoreRoot,
}

#[derive(Clone, Copy, Debug)]
pub enum ParseError {
    NotABool,
}

/// The strings used to build a configuration.
pub trait Strings {
    /// Retrieves the value for the key `key`.
    ///
    /// `key` must be one of the `ENV_` values below.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;
}

/// An implementation of `Strings` that reads the values from environment
/// variables.
pub struct Env;

pub struct TestEnv {
    values: HashMap<&'static str, String>,
}

// Environment variables to look at when loading the configuration
pub const ENV_INGRESS: &str = "FLOWMARK_INGRESS";
pub const ENV_MAY_USE_ORIGINAL_SOURCE_ADDRESS: &str = "FLOWMARK_MAY_USE_ORIGINAL_SOURCE_ADDRESS";
pub const ENV_EGRESS_MARK_SOURCE_ENDPOINT_ID: &str = "FLOWMARK_EGRESS_MARK_SOURCE_ENDPOINT_ID";
pub const ENV_NO_LOCAL_ENFORCEMENT: &str = "FLOWMARK_NO_LOCAL_ENFORCEMENT";
pub const ENV_STORE_ROOT: &str = "FLOWMARK_STORE_ROOT";

// ===== impl Config =====

impl Config {
    /// Loads a `Config` from the given strings, typically `Env`.
    pub fn try_from(strings: &dyn Strings) -> Result<Config, Error> {
        // Parse all the variables first so each invalid one is logged
        // before any error is returned.
        let is_ingress = parse(strings, ENV_INGRESS, parse_bool);
        let may_use_original_source_address =
            parse(strings, ENV_MAY_USE_ORIGINAL_SOURCE_ADDRESS, parse_bool);
        let egress_mark_source_endpoint_id =
            parse(strings, ENV_EGRESS_MARK_SOURCE_ENDPOINT_ID, parse_bool);
        let no_local_enforcement = parse(strings, ENV_NO_LOCAL_ENFORCEMENT, parse_bool);
        let store_root = strings.get(ENV_STORE_ROOT);

        let config = Config {
            is_ingress: is_ingress?.unwrap_or(false),
            may_use_original_source_address: may_use_original_source_address?.unwrap_or(false),
            egress_mark_source_endpoint_id: egress_mark_source_endpoint_id?.unwrap_or(false),
            no_local_enforcement: no_local_enforcement?.unwrap_or(false),
            store_root: store_root?.and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(s))
                }
            }),
        };

        if config.egress_mark_source_endpoint_id && config.is_ingress {
            error!(
                "{} may not be set together with {}",
                ENV_EGRESS_MARK_SOURCE_ENDPOINT_ID, ENV_INGRESS
            );
            return Err(Error::ConflictingFlags);
        }

        Ok(config)
    }
}

// ===== impl Error =====

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::InvalidEnvVar => write!(f, "invalid environment variable"),
            Error::ConflictingFlags => write!(
                f,
                "{} may not be set together with {}",
                ENV_EGRESS_MARK_SOURCE_ENDPOINT_ID, ENV_INGRESS
            ),
            Error::InconsistentStoreRoot => {
                write!(f, "filter instances name different store roots")
            }
        }
    }
}

// ===== impl Env =====

impl Strings for Env {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => {
                error!("{} is not encoded in Unicode", key);
                Err(Error::InvalidEnvVar)
            }
        }
    }
}

// ===== impl TestEnv =====

impl TestEnv {
    pub fn new() -> TestEnv {
        TestEnv {
            values: Default::default(),
        }
    }

    pub fn put(&mut self, key: &'static str, value: String) {
        self.values.insert(key, value);
    }
}

impl Strings for TestEnv {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.get(key).cloned())
    }
}

// ===== Parsing =====

fn parse_bool(s: &str) -> Result<bool, ParseError> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ParseError::NotABool),
    }
}

fn parse<T, Parse>(strings: &dyn Strings, name: &str, parse: Parse) -> Result<Option<T>, Error>
where
    Parse: FnOnce(&str) -> Result<T, ParseError>,
{
    match strings.get(name)? {
        Some(ref s) => {
            let r = parse(s).map_err(|parse_error| {
                error!("{} is not valid: {:?}", name, parse_error);
                Error::InvalidEnvVar
            })?;
            Ok(Some(r))
        }
        None => Ok(None),
    }
}
