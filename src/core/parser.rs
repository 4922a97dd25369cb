//! YAML parsing, validation and advisories for `median.yaml`.
//!
//! Validation collects every finding before failing:
//! - Version must be "1.0"
//! - Identifiers (ARNs, group ids, names) must be well-formed
//! - Subnet segments must fit the address space
//! - Each enabled stack must find the tiers and prerequisites it needs
//!
//! Advisories never fail validation; they flag values that bypass the
//! composition (externally created boundaries and roles).

use super::cidr::{Ipv4Cidr, SubnetAllocator};
use super::types::*;
use crate::error::{InfraError, Result};
use regex::Regex;
use std::path::Path;

/// Configuration written by `init`.
pub const DEFAULT_CONFIG: &str = r#"version: "1.0"
name: median
description: "Median backend infrastructure"
resource_prefix: Median

env:
  region: ap-southeast-1

network:
  description: Median VPC Stack
  cidr: 10.0.0.0/16
  availability_zones: [ap-southeast-1a, ap-southeast-1b]
  subnets:
    - { name: public, tier: public, cidr_mask: 24 }
    - { name: private, tier: private_with_egress, cidr_mask: 24 }
    - { name: isolated, tier: private_isolated, cidr_mask: 24 }

load_balancing:
  description: Median ALB Stack
  certificate_arn: arn:aws:acm:ap-southeast-1:046397301718:certificate/d006d91a-71d5-4940-8fcf-816674b88903
  key_pair: median-key-pair
  instance_type: t2.micro
  machine_image:
    generic:
      ap-southeast-1: ami-02dcd6051cdd9671b
  bootstrap:
    - yum update -y
    - systemctl restart nginx
    - systemctl enable nginx
    - cd /usr/src/app/median-backend-rest-api
    - pm2 start dist/src/main.js --watch
  instance_identity:
    role_name: MedianEC2InstanceProfile
    description: Median Role for EC2 instances
    managed_policies:
      - AmazonSSMManagedInstanceCore
      - service-role/AmazonEC2RoleforAWSCodeDeploy
      - AWSCodeDeployDeployerAccess
  capacity: { min: 1, desired: 2, max: 3 }

deployment:
  description: Median Codedeploy Stack
  role:
    external_arn: arn:aws:iam::046397301718:role/AWSCodeDeployDeployerAccess
  rollout: all_at_once

database:
  description: Median RDS Stack
  engine: postgres
  database_name: median
  compute_boundary:
    external_id: sg-0e5b7aaaf262950c6
  removal_policy: destroy
  delete_automated_backups: false
  deletion_protection: false

bastion:
  description: Median Bastion Host Stack
  key_pair: median-key-pair
  instance_type: t2.micro
  machine_image: latest_amazon_linux2023
  admin_port: 22
  admin_source: 0.0.0.0/0
  zones: [ap-southeast-1a, ap-southeast-1b]
"#;

const MIN_SUBNET_PREFIX: u8 = 16;
const MAX_SUBNET_PREFIX: u8 = 28;
const MIN_DB_STORAGE_GIB: u32 = 20;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Compiled identifier patterns.
struct Patterns {
    prefix: Regex,
    region: Regex,
    account: Regex,
    certificate_arn: Regex,
    role_arn: Regex,
    group_id: Regex,
    db_name: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let re = |p: &str| {
            Regex::new(p).map_err(|e| InfraError::config(format!("bad pattern {}: {}", p, e)))
        };
        Ok(Self {
            prefix: re(r"^[A-Za-z][A-Za-z0-9]*$")?,
            region: re(r"^[a-z]{2}(-[a-z]+)+-\d$")?,
            account: re(r"^\d{12}$")?,
            certificate_arn: re(r"^arn:aws[a-z-]*:acm:[a-z0-9-]+:\d{12}:certificate/[A-Za-z0-9-]+$")?,
            role_arn: re(r"^arn:aws[a-z-]*:iam::\d{12}:role/[\w+=,.@/-]+$")?,
            group_id: re(r"^sg-[0-9a-f]{8,17}$")?,
            db_name: re(r"^[A-Za-z][A-Za-z0-9_]{0,62}$")?,
        })
    }
}

/// Parse a median.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<InfraConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| InfraError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse a median.yaml from a string.
///
/// Enum variants carrying data are written as single-key maps
/// (`machine_image: {generic: {...}}`), unit variants as plain strings.
pub fn parse_config(yaml: &str) -> Result<InfraConfig> {
    let de = serde_yaml_ng::Deserializer::from_str(yaml);
    Ok(serde_yaml_ng::with::singleton_map_recursive::deserialize(de)?)
}

/// Render a config in the same YAML shape [`parse_config`] reads.
pub fn config_to_yaml(config: &InfraConfig) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_yaml_ng::Serializer::new(&mut buf);
    serde_yaml_ng::with::singleton_map_recursive::serialize(config, &mut ser)?;
    String::from_utf8(buf).map_err(|e| InfraError::config(format!("rendered YAML is not UTF-8: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &InfraConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });

    let patterns = match Patterns::compile() {
        Ok(p) => p,
        Err(e) => {
            err(e.to_string());
            return errors;
        }
    };

    if config.version != "1.0" {
        err(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.name.trim().is_empty() {
        err("name must not be empty".to_string());
    }
    if !patterns.prefix.is_match(&config.resource_prefix) {
        err(format!(
            "resource_prefix '{}' must be alphanumeric and start with a letter",
            config.resource_prefix
        ));
    }
    if let Some(region) = &config.env.region {
        if !patterns.region.is_match(region) {
            err(format!("env.region '{}' is not a region name", region));
        }
    }
    if let Some(account) = &config.env.account {
        if !patterns.account.is_match(account) {
            err(format!("env.account '{}' must be 12 digits", account));
        }
    }

    validate_network(config, &mut err);
    validate_load_balancing(config, &patterns, &mut err);
    validate_deployment(config, &patterns, &mut err);
    validate_database(config, &patterns, &mut err);
    validate_bastion(config, &mut err);
    validate_stack_names(config, &mut err);

    errors
}

fn has_tier(config: &InfraConfig, tier: Tier) -> bool {
    config.network.subnets.iter().any(|s| s.tier == tier)
}

fn validate_network(config: &InfraConfig, err: &mut impl FnMut(String)) {
    let net = &config.network;

    if net.availability_zones.is_empty() {
        err("network.availability_zones must not be empty".to_string());
    }
    for (i, zone) in net.availability_zones.iter().enumerate() {
        if net.availability_zones[..i].contains(zone) {
            err(format!("network zone '{}' is listed twice", zone));
        }
        if let Some(region) = &config.env.region {
            if !zone.starts_with(region.as_str()) {
                err(format!("network zone '{}' is not in region '{}'", zone, region));
            }
        }
    }

    if net.subnets.is_empty() {
        err("network.subnets must declare at least one segment".to_string());
    }
    for (i, seg) in net.subnets.iter().enumerate() {
        if net.subnets[..i].iter().any(|s| s.name == seg.name) {
            err(format!("subnet segment '{}' is declared twice", seg.name));
        }
        if !(MIN_SUBNET_PREFIX..=MAX_SUBNET_PREFIX).contains(&seg.cidr_mask) {
            err(format!(
                "subnet segment '{}' cidr_mask /{} outside /{}../{}",
                seg.name, seg.cidr_mask, MIN_SUBNET_PREFIX, MAX_SUBNET_PREFIX
            ));
        }
    }

    match net.cidr.parse::<Ipv4Cidr>() {
        Ok(space) => {
            let mut alloc = SubnetAllocator::new(space);
            'segments: for seg in &net.subnets {
                for zone in &net.availability_zones {
                    if let Err(e) = alloc.allocate(seg.cidr_mask) {
                        err(format!("subnet '{}' in {}: {}", seg.name, zone, e));
                        break 'segments;
                    }
                }
            }
        }
        Err(e) => err(format!("network.cidr: {}", e)),
    }

    let has_public = has_tier(config, Tier::Public);
    if has_tier(config, Tier::PrivateWithEgress) {
        if !has_public {
            err("private_with_egress subnets need a public segment for NAT gateways".to_string());
        }
        if net.nat_gateways == Some(0) {
            err("private_with_egress subnets need at least one NAT gateway".to_string());
        }
    }
    if let Some(n) = net.nat_gateways {
        if usize::try_from(n).map_or(true, |n| n > net.availability_zones.len()) {
            err(format!(
                "network.nat_gateways {} exceeds the {} zone(s)",
                n,
                net.availability_zones.len()
            ));
        }
    }
}

fn validate_load_balancing(config: &InfraConfig, patterns: &Patterns, err: &mut impl FnMut(String)) {
    let Some(lb) = &config.load_balancing else {
        return;
    };
    if !patterns.certificate_arn.is_match(&lb.certificate_arn) {
        err(format!(
            "load_balancing.certificate_arn '{}' is not a certificate ARN",
            lb.certificate_arn
        ));
    }
    if lb.key_pair.trim().is_empty() {
        err("load_balancing.key_pair must not be empty".to_string());
    }
    if lb.instance_type.trim().is_empty() {
        err("load_balancing.instance_type must not be empty".to_string());
    }
    if !lb.capacity.is_valid() {
        err(format!(
            "load_balancing.capacity must satisfy min <= desired <= max (got {}/{}/{})",
            lb.capacity.min, lb.capacity.desired, lb.capacity.max
        ));
    }
    if !lb.health_check_path.starts_with('/') {
        err(format!(
            "load_balancing.health_check_path '{}' must start with '/'",
            lb.health_check_path
        ));
    }
    validate_image("load_balancing", &lb.machine_image, config, err);
    if !has_tier(config, Tier::Public) {
        err("load_balancing needs a public subnet segment".to_string());
    }
    if !has_tier(config, Tier::PrivateWithEgress) {
        err("load_balancing needs a private_with_egress subnet segment".to_string());
    }
    if config.network.availability_zones.len() < 2 {
        err("load_balancing needs at least two availability zones".to_string());
    }
}

fn validate_image(owner: &str, image: &MachineImage, config: &InfraConfig, err: &mut impl FnMut(String)) {
    if let MachineImage::Generic(by_region) = image {
        if by_region.is_empty() {
            err(format!("{}.machine_image.generic is empty", owner));
        }
        if let Some(region) = &config.env.region {
            if !by_region.contains_key(region) {
                err(format!(
                    "{}.machine_image has no image for region '{}'",
                    owner, region
                ));
            }
        }
    }
}

fn validate_deployment(config: &InfraConfig, patterns: &Patterns, err: &mut impl FnMut(String)) {
    let Some(dc) = &config.deployment else {
        return;
    };
    if config.load_balancing.is_none() {
        err("deployment requires load_balancing".to_string());
    }
    if let DeploymentRole::ExternalArn(arn) = &dc.role {
        if !patterns.role_arn.is_match(arn) {
            err(format!("deployment.role.external_arn '{}' is not a role ARN", arn));
        }
    }
}

fn validate_database(config: &InfraConfig, patterns: &Patterns, err: &mut impl FnMut(String)) {
    let Some(db) = &config.database else {
        return;
    };
    if !patterns.db_name.is_match(&db.database_name) {
        err(format!(
            "database.database_name '{}' must start with a letter and contain only letters, digits, '_'",
            db.database_name
        ));
    }
    if db.master_username.trim().is_empty() {
        err("database.master_username must not be empty".to_string());
    }
    if db.allocated_storage < MIN_DB_STORAGE_GIB {
        err(format!(
            "database.allocated_storage must be at least {} GiB",
            MIN_DB_STORAGE_GIB
        ));
    }
    match &db.compute_boundary {
        ComputeBoundary::ExternalId(id) => {
            if !patterns.group_id.is_match(id) {
                err(format!(
                    "database.compute_boundary.external_id '{}' is not a security group id",
                    id
                ));
            }
        }
        ComputeBoundary::FromLoadBalancer => {
            if config.load_balancing.is_none() {
                err("database.compute_boundary from_load_balancer requires load_balancing".to_string());
            }
        }
    }
    if !has_tier(config, Tier::PrivateIsolated) {
        err("database needs a private_isolated subnet segment".to_string());
    }
}

fn validate_bastion(config: &InfraConfig, err: &mut impl FnMut(String)) {
    let Some(b) = &config.bastion else {
        return;
    };
    if b.key_pair.trim().is_empty() {
        err("bastion.key_pair must not be empty".to_string());
    }
    if b.admin_port == 0 {
        err("bastion.admin_port must not be 0".to_string());
    }
    if let Err(e) = b.admin_source.parse::<Ipv4Cidr>() {
        err(format!("bastion.admin_source: {}", e));
    }
    for zone in &b.zones {
        if !config.network.availability_zones.contains(zone) {
            err(format!("bastion zone '{}' is not a network zone", zone));
        }
    }
    validate_image("bastion", &b.machine_image, config, err);
    if !has_tier(config, Tier::Public) {
        err("bastion needs a public subnet segment".to_string());
    }
}

fn validate_stack_names(config: &InfraConfig, err: &mut impl FnMut(String)) {
    let mut kinds = vec![StackKind::Network];
    if config.load_balancing.is_some() {
        kinds.push(StackKind::LoadBalancing);
    }
    if config.deployment.is_some() {
        kinds.push(StackKind::Deployment);
    }
    if config.database.is_some() {
        kinds.push(StackKind::Database);
    }
    if config.bastion.is_some() {
        kinds.push(StackKind::Bastion);
    }
    let names: Vec<String> = kinds.iter().map(|k| config.stack_name(*k)).collect();
    for (i, name) in names.iter().enumerate() {
        if names[..i].contains(name) {
            err(format!("stack name '{}' is used by more than one definition", name));
        }
    }
}

/// Non-fatal findings about values that bypass the composition.
pub fn advisories(config: &InfraConfig) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(db) = &config.database {
        if let ComputeBoundary::ExternalId(id) = &db.compute_boundary {
            out.push(format!(
                "database admits '{}', a security group created outside this app; \
                 use compute_boundary: from_load_balancer to reference the fleet's boundary",
                id
            ));
        }
    }
    if let Some(dc) = &config.deployment {
        if let DeploymentRole::ExternalArn(arn) = &dc.role {
            out.push(format!(
                "deployment group assumes '{}', a role managed outside this app; \
                 use role: managed to create it here",
                arn
            ));
        }
    }
    if let Some(b) = &config.bastion {
        if b.admin_source == "0.0.0.0/0" {
            out.push(format!(
                "bastion port {} is open to 0.0.0.0/0",
                b.admin_port
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(config: &InfraConfig) -> Vec<String> {
        validate_config(config).into_iter().map(|e| e.message).collect()
    }

    const MINIMAL: &str = r#"
version: "1.0"
name: median
env:
  region: ap-southeast-1
network:
  availability_zones: [ap-southeast-1a, ap-southeast-1b]
"#;

    #[test]
    fn test_default_config_valid() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        let errors = messages(&config);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(config.load_balancing.as_ref().unwrap().bootstrap.len(), 5);
    }

    #[test]
    fn test_default_config_advisories() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        let adv = advisories(&config);
        assert_eq!(adv.len(), 3);
        assert!(adv[0].contains("sg-0e5b7aaaf262950c6"));
        assert!(adv[1].contains("AWSCodeDeployDeployerAccess"));
    }

    #[test]
    fn test_bad_version() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.version = "2.0".to_string();
        assert!(messages(&config).iter().any(|m| m.contains("version")));
    }

    #[test]
    fn test_bad_identifiers() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.load_balancing.as_mut().unwrap().certificate_arn = "not-an-arn".to_string();
        config.deployment.as_mut().unwrap().role = DeploymentRole::ExternalArn("arn:aws:iam::1:role/x".into());
        config.database.as_mut().unwrap().compute_boundary = ComputeBoundary::ExternalId("sg-XYZ".into());
        let errors = messages(&config);
        assert!(errors.iter().any(|m| m.contains("certificate ARN")));
        assert!(errors.iter().any(|m| m.contains("role ARN")));
        assert!(errors.iter().any(|m| m.contains("security group id")));
    }

    #[test]
    fn test_address_space_overflow() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.network.cidr = "10.0.0.0/23".to_string();
        let errors = messages(&config);
        assert!(errors.iter().any(|m| m.contains("exhausted")), "{:?}", errors);
    }

    #[test]
    fn test_mask_out_of_range() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.network.subnets[0].cidr_mask = 30;
        assert!(messages(&config).iter().any(|m| m.contains("/30")));
    }

    #[test]
    fn test_zone_outside_region() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.network.availability_zones.push("us-east-1a".to_string());
        assert!(messages(&config).iter().any(|m| m.contains("not in region")));
    }

    #[test]
    fn test_capacity_violation() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.load_balancing.as_mut().unwrap().capacity = Capacity { min: 3, desired: 1, max: 2 };
        assert!(messages(&config).iter().any(|m| m.contains("min <= desired <= max")));
    }

    #[test]
    fn test_missing_tiers_and_prerequisites() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.network.subnets.retain(|s| s.tier == Tier::Public);
        config.load_balancing = None;
        let errors = messages(&config);
        assert!(errors.iter().any(|m| m.contains("deployment requires load_balancing")));
        assert!(errors.iter().any(|m| m.contains("private_isolated")));
    }

    #[test]
    fn test_image_missing_region() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.env.region = Some("eu-west-1".to_string());
        config.network.availability_zones = vec!["eu-west-1a".into(), "eu-west-1b".into()];
        config.bastion.as_mut().unwrap().zones.clear();
        let errors = messages(&config);
        assert!(errors.iter().any(|m| m.contains("no image for region 'eu-west-1'")), "{:?}", errors);
    }

    #[test]
    fn test_duplicate_stack_names() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.bastion.as_mut().unwrap().stack_name = Some("MedianVPCStack".to_string());
        assert!(messages(&config).iter().any(|m| m.contains("more than one definition")));
    }

    #[test]
    fn test_bastion_unknown_zone() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        config.bastion.as_mut().unwrap().zones = vec!["ap-southeast-1c".to_string()];
        assert!(messages(&config).iter().any(|m| m.contains("not a network zone")));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("median.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.name, "median");
    }

    #[test]
    fn test_parse_missing_file() {
        let err = parse_config_file(Path::new("/nonexistent/median.yaml")).unwrap_err();
        assert!(matches!(err, InfraError::Read { .. }));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(matches!(
            parse_config("not: [valid: yaml: {{"),
            Err(InfraError::Yaml(_))
        ));
    }

    #[test]
    fn test_default_config_data_variants() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        let lb = config.load_balancing.as_ref().unwrap();
        assert!(matches!(&lb.machine_image, MachineImage::Generic(m) if m["ap-southeast-1"] == "ami-02dcd6051cdd9671b"));
        assert!(matches!(
            &config.deployment.as_ref().unwrap().role,
            DeploymentRole::ExternalArn(arn) if arn.ends_with("role/AWSCodeDeployDeployerAccess")
        ));
        assert_eq!(
            config.database.as_ref().unwrap().compute_boundary,
            ComputeBoundary::ExternalId("sg-0e5b7aaaf262950c6".to_string())
        );
        assert_eq!(
            config.bastion.as_ref().unwrap().machine_image,
            MachineImage::LatestAmazonLinux2023
        );
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let mut config = parse_config(DEFAULT_CONFIG).unwrap();
        let yaml = config_to_yaml(&config).unwrap();
        assert!(yaml.contains("generic:"));
        assert!(yaml.contains("external_arn:"));
        assert!(yaml.contains("external_id:"));
        assert!(!yaml.contains('!'));
        assert_eq!(parse_config(&yaml).unwrap(), config);

        if let Some(db) = config.database.as_mut() {
            db.compute_boundary = ComputeBoundary::FromLoadBalancer;
        }
        if let Some(dc) = config.deployment.as_mut() {
            dc.role = DeploymentRole::Managed;
        }
        let yaml = config_to_yaml(&config).unwrap();
        assert!(yaml.contains("compute_boundary: from_load_balancer"));
        assert!(yaml.contains("role: managed"));
        assert_eq!(parse_config(&yaml).unwrap(), config);
    }
}
