use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::{Command, GlobalOptions, Invocation};
use crate::client::{InvocationClient, port_var};
use crate::config::HermesConfig;
use crate::environment::{DeploymentEnvironment, detect};
use crate::error::{ComponentError, RegistryClientError};
use crate::logging;
use crate::registry::{ComponentRegistration, RegistryClient, RegistryClientConfig};

/// Exit code for "the thing you asked about does not exist".
pub const EXIT_NOT_FOUND: i32 = 2;

/// Exit code for an unreachable registry or component.
pub const EXIT_UNAVAILABLE: i32 = 3;

pub fn run(invocation: Invocation) -> Result<i32> {
    logging::init(invocation.globals.verbose);
    let config = load_config(&invocation.globals)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(dispatch(invocation.command, config))
}

fn load_config(globals: &GlobalOptions) -> Result<HermesConfig> {
    let mut config = HermesConfig::load_or_default(globals.config.as_deref())
        .context("failed to load hermes configuration")?;
    if let Some(ref url) = globals.registry_url {
        config.client.registry_url = url.trim_end_matches('/').to_string();
    }
    Ok(config)
}

async fn dispatch(command: Command, config: HermesConfig) -> Result<i32> {
    match execute(command, &config).await {
        Ok(code) => Ok(code),
        Err(err) => match err.downcast_ref::<RegistryClientError>() {
            Some(client_err) => Ok(report_registry_error(client_err)),
            None => Err(err),
        },
    }
}

async fn execute(command: Command, config: &HermesConfig) -> Result<i32> {
    let registry =
        || RegistryClient::new(RegistryClientConfig::with_url(&config.client.registry_url));

    match command {
        Command::ShowEnvironment => show_environment(config),
        Command::List(filter) => print_json(&registry()?.list(&filter).await?),
        Command::Resolve { component } => print_json(&registry()?.resolve(&component).await?),
        Command::Endpoints { component } => {
            print_json(&registry()?.endpoints(&component).await?)
        }
        Command::Search { query } => print_json(&registry()?.search(&query).await?),
        Command::Info { component } => print_json(&registry()?.metadata(&component).await?),
        Command::Versions { component } => {
            print_json(&registry()?.versions(&component).await?)
        }
        Command::Register { manifest, session } => {
            let raw = std::fs::read_to_string(&manifest)
                .with_context(|| format!("failed to read {}", manifest.display()))?;
            let registration: ComponentRegistration = serde_json::from_str(&raw)
                .with_context(|| format!("invalid registration in {}", manifest.display()))?;
            registration.validate()?;
            print_json(&registry()?.register(&registration, session.as_deref()).await?)
        }
        Command::Heartbeat {
            id,
            unhealthy_endpoints,
        } => print_json(&registry()?.heartbeat(&id, None, &unhealthy_endpoints).await?),
        Command::Unregister { id } => {
            registry()?.unregister(&id).await?;
            println!("unregistered {id}");
            Ok(0)
        }
        Command::Invoke {
            component,
            capability,
            parameters,
            security,
            deadline_ms,
        } => {
            let client = InvocationClient::from_config(config)?;
            let outcome = match deadline_ms {
                Some(ms) => {
                    client
                        .invoke_with_deadline(
                            &component,
                            &capability,
                            parameters,
                            &security,
                            Duration::from_millis(ms),
                        )
                        .await
                }
                None => {
                    client
                        .invoke(&component, &capability, parameters, &security)
                        .await
                }
            };
            match outcome {
                Ok(value) => print_json(&value),
                Err(err) => Ok(report_component_error(&err)),
            }
        }
    }
}

fn show_environment(config: &HermesConfig) -> Result<i32> {
    let signals = config.environment_signals();
    let environment: DeploymentEnvironment = detect(&signals);
    let rules = config.address_rules(environment);

    println!("environment:   {environment}");
    println!(
        "override:      {}",
        signals.override_value.as_deref().unwrap_or("-")
    );
    println!("cluster:       {}", signals.cluster_signal);
    println!("container:     {}", signals.container_marker);
    if environment == DeploymentEnvironment::Kubernetes {
        println!("namespace:     {}", rules.namespace);
    }
    println!("registry:      {}", config.client.registry_url);

    let sample = "hermes";
    let port = config.port_for(sample).unwrap_or(config.client.default_port);
    println!(
        "example:       {} -> {} (override with {})",
        sample,
        rules.static_url(sample, port),
        port_var(sample)
    );
    Ok(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(0)
}

fn report_registry_error(err: &RegistryClientError) -> i32 {
    eprintln!("error: {err}");
    match err {
        RegistryClientError::NotFound(_) => EXIT_NOT_FOUND,
        RegistryClientError::Unavailable { .. } => EXIT_UNAVAILABLE,
        _ => 1,
    }
}

fn report_component_error(err: &ComponentError) -> i32 {
    eprintln!("error [{}]: {err}", err.kind());
    match err {
        ComponentError::ComponentNotFound(_) | ComponentError::CapabilityNotFound { .. } => {
            EXIT_NOT_FOUND
        }
        ComponentError::ComponentUnavailable { .. } | ComponentError::DeadlineExceeded { .. } => {
            EXIT_UNAVAILABLE
        }
        _ => 1,
    }
}
