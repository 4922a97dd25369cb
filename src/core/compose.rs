//! Composition root: declares every enabled stack in dependency order and
//! threads handles between them.

use super::app::{App, BoundarySource};
use super::parser;
use super::types::{ComputeBoundary, Environment, EnvironmentConfig, InfraConfig};
use crate::error::{InfraError, Result};
use crate::stacks::{bastion, database, deployment, load_balancing, network};
use tracing::{error, info};

pub const ACCOUNT_VAR: &str = "CDK_DEFAULT_ACCOUNT";
pub const REGION_VAR: &str = "CDK_DEFAULT_REGION";

/// Resolve account and region, falling back to the process environment.
pub fn resolve_environment(config: &EnvironmentConfig) -> Result<Environment> {
    resolve_environment_with(config, |key| std::env::var(key).ok())
}

/// Same as [`resolve_environment`] with an injectable variable lookup.
pub fn resolve_environment_with<F>(config: &EnvironmentConfig, lookup: F) -> Result<Environment>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let account = non_empty(config.account.clone()).or_else(|| non_empty(lookup(ACCOUNT_VAR)));
    let region = non_empty(config.region.clone())
        .or_else(|| non_empty(lookup(REGION_VAR)))
        .ok_or_else(|| {
            InfraError::config(format!(
                "no region: set env.region in the config or {}",
                REGION_VAR
            ))
        })?;
    Ok(Environment { account, region })
}

/// Build the app from the config using the process environment.
pub fn compose(config: &InfraConfig) -> Result<App> {
    let env = resolve_environment(&config.env)?;
    compose_in(config, env)
}

/// Build the app for an already resolved environment.
///
/// The config is validated first; any finding fails composition.
/// Order: network, load balancing, deployment, database, bastion.
pub fn compose_in(config: &InfraConfig, env: Environment) -> Result<App> {
    let errors = parser::validate_config(config);
    if !errors.is_empty() {
        for e in &errors {
            error!("{}", e);
        }
        return Err(InfraError::Validation(errors.len()));
    }

    let mut app = App::new(&config.name, env);

    let net = network::declare(&mut app, config)?;

    let lb = match &config.load_balancing {
        Some(_) => Some(load_balancing::declare(&mut app, config, &net)?),
        None => None,
    };

    if let Some(dc) = &config.deployment {
        let lb = lb.as_ref().ok_or_else(|| {
            InfraError::config("deployment requires load_balancing (it binds to the fleet)")
        })?;
        let binding = deployment::DeploymentBinding::from_load_balancing(lb, dc.rollout);
        deployment::declare(&mut app, config, binding)?;
    }

    if let Some(db) = &config.database {
        let compute = match &db.compute_boundary {
            ComputeBoundary::FromLoadBalancer => {
                let lb = lb.as_ref().ok_or_else(|| {
                    InfraError::config(
                        "database.compute_boundary from_load_balancer requires load_balancing",
                    )
                })?;
                BoundarySource::Declared(lb.compute_boundary.clone())
            }
            ComputeBoundary::ExternalId(id) => BoundarySource::External(id.clone()),
        };
        database::declare(&mut app, config, &net, compute)?;
    }

    if config.bastion.is_some() {
        bastion::declare(&mut app, config, &net)?;
    }

    info!(app = %app.name, env = %app.env, stacks = app.len(), "composed app");
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment {
            account: Some("046397301718".to_string()),
            region: "ap-southeast-1".to_string(),
        }
    }

    #[test]
    fn test_env_from_config_wins() {
        let cfg = EnvironmentConfig {
            account: Some("111111111111".into()),
            region: Some("us-east-1".into()),
        };
        let env = resolve_environment_with(&cfg, |_| Some("ignored".into())).unwrap();
        assert_eq!(env.account.as_deref(), Some("111111111111"));
        assert_eq!(env.region, "us-east-1");
    }

    #[test]
    fn test_env_falls_back_to_variables() {
        let env = resolve_environment_with(&EnvironmentConfig::default(), |key| match key {
            ACCOUNT_VAR => Some("222222222222".into()),
            REGION_VAR => Some("eu-west-1".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(env.account.as_deref(), Some("222222222222"));
        assert_eq!(env.region, "eu-west-1");
    }

    #[test]
    fn test_env_missing_region() {
        let err = resolve_environment_with(&EnvironmentConfig::default(), |_| None).unwrap_err();
        assert!(err.to_string().contains(REGION_VAR));
    }

    #[test]
    fn test_default_config_composes_five_stacks() {
        let config = parser::parse_config(parser::DEFAULT_CONFIG).unwrap();
        let app = compose_in(&config, env()).unwrap();
        let names: Vec<&str> = app.stacks().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "MedianVPCStack",
                "MedianAlbStack",
                "MedianCodedeployStack",
                "MedianRdsStack",
                "MedianBastionHostStack"
            ]
        );
        assert!(app.stack("MedianVPCStack").unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_deployment_without_load_balancing_rejected() {
        let yaml = r#"
version: "1.0"
name: median
network:
  availability_zones: [ap-southeast-1a, ap-southeast-1b]
deployment: {}
"#;
        let config = parser::parse_config(yaml).unwrap();
        let err = compose_in(&config, env()).unwrap_err();
        assert!(matches!(err, InfraError::Validation(_)));
    }

    #[test]
    fn test_invalid_config_not_composed() {
        let mut config = parser::parse_config(parser::DEFAULT_CONFIG).unwrap();
        if let Some(b) = config.bastion.as_mut() {
            b.admin_source = "anywhere".to_string();
        }
        assert!(matches!(
            compose_in(&config, env()),
            Err(InfraError::Validation(_))
        ));
    }

    #[test]
    fn test_database_from_load_balancer_boundary() {
        let yaml = r#"
version: "1.0"
name: median
network:
  availability_zones: [ap-southeast-1a, ap-southeast-1b]
load_balancing:
  certificate_arn: arn:aws:acm:ap-southeast-1:046397301718:certificate/abc
  key_pair: median-key-pair
database:
  database_name: median
"#;
        let config = parser::parse_config(yaml).unwrap();
        let app = compose_in(&config, env()).unwrap();
        let rds = app.stack("MedianRdsStack").unwrap();
        assert!(rds.dependencies.contains(&"MedianAlbStack".to_string()));
        assert!(rds.dependencies.contains(&"MedianVPCStack".to_string()));
    }

    #[test]
    fn test_network_only() {
        let yaml = r#"
version: "1.0"
name: median
network:
  availability_zones: [ap-southeast-1a]
"#;
        let config = parser::parse_config(yaml).unwrap();
        let app = compose_in(&config, env()).unwrap();
        assert_eq!(app.len(), 1);
    }
}
