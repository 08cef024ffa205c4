use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand, ValueHint, builder::NonEmptyStringValueParser};
use serde_json::Value;

use crate::client::SecurityContext;
use crate::registry::{ListFilter, StatusFilter};

/// Options shared by every command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalOptions {
    pub registry_url: Option<String>,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ShowEnvironment,
    List(ListFilter),
    Resolve {
        component: String,
    },
    Endpoints {
        component: String,
    },
    Search {
        query: String,
    },
    Info {
        component: String,
    },
    Versions {
        component: String,
    },
    Register {
        manifest: PathBuf,
        session: Option<String>,
    },
    Heartbeat {
        id: String,
        unhealthy_endpoints: Vec<String>,
    },
    Unregister {
        id: String,
    },
    Invoke {
        component: String,
        capability: String,
        parameters: Value,
        security: SecurityContext,
        deadline_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub globals: GlobalOptions,
    pub command: Command,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Invocation> {
    convert(Cli::parse())
}

pub fn parse_from<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    convert(Cli::try_parse_from(args)?)
}

fn convert(cli: Cli) -> Result<Invocation> {
    let globals = GlobalOptions {
        registry_url: cli.registry,
        config: cli.config,
        verbose: cli.verbose,
    };

    let command = match cli.command {
        Sub::Env => Command::ShowEnvironment,
        Sub::List {
            component_type,
            capability,
            status,
        } => {
            let status: StatusFilter = status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            Command::List(ListFilter {
                component_type,
                capability,
                status,
            })
        }
        Sub::Resolve { component } => Command::Resolve { component },
        Sub::Endpoints { component } => Command::Endpoints { component },
        Sub::Search { query } => Command::Search {
            query: query.unwrap_or_default(),
        },
        Sub::Info { component } => Command::Info { component },
        Sub::Versions { component } => Command::Versions { component },
        Sub::Register { manifest, session } => Command::Register { manifest, session },
        Sub::Heartbeat { id, unhealthy } => Command::Heartbeat {
            id,
            unhealthy_endpoints: unhealthy,
        },
        Sub::Unregister { id } => Command::Unregister { id },
        Sub::Invoke {
            component,
            capability,
            params,
            token,
            roles,
            caller,
            deadline_ms,
        } => {
            let parameters = match params {
                Some(raw) => serde_json::from_str(&raw)
                    .with_context(|| format!("--params is not valid JSON: {raw}"))?,
                None => Value::Object(Default::default()),
            };
            if let Some(ms) = deadline_ms {
                ensure!(ms > 0, "--deadline-ms must be positive");
            }

            let mut security = SecurityContext::anonymous();
            if let Some(token) = token {
                security = security.with_token(&token);
            }
            for role in roles.iter().flat_map(|r| r.split(',')) {
                let role = role.trim();
                if !role.is_empty() {
                    security = security.with_role(role);
                }
            }
            if let Some(caller) = caller {
                security = security.with_caller(&caller);
            }

            Command::Invoke {
                component,
                capability,
                parameters,
                security,
                deadline_ms,
            }
        }
    };

    Ok(Invocation { globals, command })
}

#[derive(Parser, Debug)]
#[command(
    name = "hermes",
    about = "Tekton component registry and discovery client",
    version,
    disable_help_subcommand = true
)]
struct Cli {
    /// Registry base URL.
    #[arg(long, global = true, env = "HERMES_URL", value_name = "URL")]
    registry: Option<String>,

    /// Path to hermes.toml.
    #[arg(
        long,
        global = true,
        env = "HERMES_CONFIG",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Sub,
}

#[derive(Subcommand, Debug)]
enum Sub {
    /// Show the detected deployment environment and address rules.
    Env,

    /// List registered components.
    List {
        #[arg(long = "type", value_name = "TYPE")]
        component_type: Option<String>,

        #[arg(long, value_name = "NAME")]
        capability: Option<String>,

        /// healthy, live, degraded, expired or any.
        #[arg(long, default_value = "healthy")]
        status: String,
    },

    /// Print the current URL of a component.
    Resolve {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        component: String,
    },

    /// Print every endpoint a component registered.
    Endpoints {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        component: String,
    },

    /// Search the registry catalog.
    Search { query: Option<String> },

    /// Show catalog metadata for one component.
    Info {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        component: String,
    },

    /// List the versions the catalog knows for a component.
    Versions {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        component: String,
    },

    /// Register a component from a JSON manifest.
    Register {
        #[arg(value_hint = ValueHint::FilePath)]
        manifest: PathBuf,

        #[arg(long)]
        session: Option<String>,
    },

    /// Send one heartbeat.
    Heartbeat {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        id: String,

        /// Endpoint names to report as unhealthy.
        #[arg(long = "unhealthy", value_name = "ENDPOINT")]
        unhealthy: Vec<String>,
    },

    /// Remove a registration.
    Unregister {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        id: String,
    },

    /// Call a capability on a component.
    Invoke {
        #[arg(value_parser = NonEmptyStringValueParser::new())]
        component: String,

        #[arg(value_parser = NonEmptyStringValueParser::new())]
        capability: String,

        /// JSON object passed as `parameters`.
        #[arg(long, value_name = "JSON")]
        params: Option<String>,

        #[arg(long, env = "TEKTON_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Comma-separated or repeated.
        #[arg(long = "role", value_name = "ROLE")]
        roles: Vec<String>,

        #[arg(long)]
        caller: Option<String>,

        #[arg(long = "deadline-ms", value_name = "MS")]
        deadline_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_defaults_to_healthy() {
        let invocation = parse_from(["hermes", "list", "--capability", "llm_complete"]).unwrap();
        assert_eq!(
            invocation.command,
            Command::List(ListFilter::healthy().with_capability("llm_complete"))
        );
    }

    #[test]
    fn test_list_rejects_unknown_status() {
        assert!(parse_from(["hermes", "list", "--status", "stale"]).is_err());
    }

    #[test]
    fn test_global_registry_after_subcommand() {
        let invocation =
            parse_from(["hermes", "resolve", "athena", "--registry", "http://h:8001"]).unwrap();
        assert_eq!(
            invocation.globals.registry_url.as_deref(),
            Some("http://h:8001")
        );
    }

    #[test]
    fn test_invoke_builds_security_context() {
        let invocation = parse_from([
            "hermes",
            "invoke",
            "budget",
            "allocate",
            "--params",
            r#"{"tokens": 10}"#,
            "--token",
            "abc",
            "--role",
            "admin,planner",
            "--caller",
            "ergon",
        ])
        .unwrap();

        match invocation.command {
            Command::Invoke {
                parameters,
                security,
                ..
            } => {
                assert_eq!(parameters["tokens"], 10);
                assert_eq!(security.token.as_deref(), Some("abc"));
                assert_eq!(security.roles, vec!["admin", "planner"]);
                assert_eq!(security.caller.as_deref(), Some("ergon"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_catalog_commands() {
        let invocation = parse_from(["hermes", "versions", "engram"]).unwrap();
        assert_eq!(
            invocation.command,
            Command::Versions {
                component: "engram".into()
            }
        );
        assert!(parse_from(["hermes", "info", ""]).is_err());
    }

    #[test]
    fn test_invoke_rejects_bad_json() {
        assert!(parse_from(["hermes", "invoke", "budget", "allocate", "--params", "{"]).is_err());
    }
}
