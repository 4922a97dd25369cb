//! Configuration schema, lock-file types, plan types and provenance events.
//!
//! `median.yaml` deserializes into [`InfraConfig`]. Every definition except the
//! network is optional so environments can enable only the stacks they need.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level median.yaml
// ============================================================================

/// Root configuration: the declared infrastructure of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InfraConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Application name (used in the manifest and event log)
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Prefix for physical names and default stack names (e.g. "Median")
    #[serde(default = "default_prefix")]
    pub resource_prefix: String,

    /// Target account and region
    #[serde(default)]
    pub env: EnvironmentConfig,

    /// Network definition (always present; every other stack places into it)
    pub network: NetworkConfig,

    /// Load balancer, target group and autoscaling fleet
    #[serde(default)]
    pub load_balancing: Option<LoadBalancingConfig>,

    /// Deployment application and group bound to the fleet
    #[serde(default)]
    pub deployment: Option<DeploymentConfig>,

    /// Managed relational database
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Jump hosts in the public tier
    #[serde(default)]
    pub bastion: Option<BastionConfig>,
}

fn default_prefix() -> String {
    "Median".to_string()
}

impl InfraConfig {
    /// Resolve the stack name for a definition: explicit override or
    /// `{prefix}{default suffix}`.
    pub fn stack_name(&self, kind: StackKind) -> String {
        let explicit = match kind {
            StackKind::Network => self.network.stack_name.as_ref(),
            StackKind::LoadBalancing => self
                .load_balancing
                .as_ref()
                .and_then(|c| c.stack_name.as_ref()),
            StackKind::Deployment => self.deployment.as_ref().and_then(|c| c.stack_name.as_ref()),
            StackKind::Database => self.database.as_ref().and_then(|c| c.stack_name.as_ref()),
            StackKind::Bastion => self.bastion.as_ref().and_then(|c| c.stack_name.as_ref()),
        };
        explicit
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.resource_prefix, kind.default_suffix()))
    }

    /// Prefix a physical resource name.
    pub fn named(&self, suffix: &str) -> String {
        format!("{}{}", self.resource_prefix, suffix)
    }
}

/// The five stack definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackKind {
    Network,
    LoadBalancing,
    Deployment,
    Database,
    Bastion,
}

impl StackKind {
    fn default_suffix(self) -> &'static str {
        match self {
            Self::Network => "VPCStack",
            Self::LoadBalancing => "AlbStack",
            Self::Deployment => "CodedeployStack",
            Self::Database => "RdsStack",
            Self::Bastion => "BastionHostStack",
        }
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::LoadBalancing => write!(f, "load_balancing"),
            Self::Deployment => write!(f, "deployment"),
            Self::Database => write!(f, "database"),
            Self::Bastion => write!(f, "bastion"),
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Account/region as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentConfig {
    /// 12-digit account id (falls back to CDK_DEFAULT_ACCOUNT)
    #[serde(default)]
    pub account: Option<String>,

    /// Region (falls back to CDK_DEFAULT_REGION)
    #[serde(default)]
    pub region: Option<String>,
}

/// Resolved deployment environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub account: Option<String>,
    pub region: String,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region
        )
    }
}

// ============================================================================
// Network
// ============================================================================

/// Network definition: address space, zones, subnet segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkConfig {
    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Physical VPC name (default `{prefix}VPC`)
    #[serde(default)]
    pub vpc_name: Option<String>,

    /// Address space
    #[serde(default = "default_vpc_cidr")]
    pub cidr: String,

    /// Availability zones, in placement order
    pub availability_zones: Vec<String>,

    /// NAT gateway count (default: one per zone)
    #[serde(default)]
    pub nat_gateways: Option<u32>,

    /// Subnet segments, allocated in this order
    #[serde(default = "default_segments")]
    pub subnets: Vec<SubnetSpec>,
}

fn default_vpc_cidr() -> String {
    "10.0.0.0/16".to_string()
}

fn default_segments() -> Vec<SubnetSpec> {
    vec![
        SubnetSpec::new("public", Tier::Public, 24),
        SubnetSpec::new("private", Tier::PrivateWithEgress, 24),
        SubnetSpec::new("isolated", Tier::PrivateIsolated, 24),
    ]
}

/// One subnet segment, replicated in every zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubnetSpec {
    pub name: String,
    pub tier: Tier,
    pub cidr_mask: u8,
}

impl SubnetSpec {
    pub fn new(name: &str, tier: Tier, cidr_mask: u8) -> Self {
        Self {
            name: name.to_string(),
            tier,
            cidr_mask,
        }
    }
}

/// Subnet tier: defines internet reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Public,
    PrivateWithEgress,
    PrivateIsolated,
}

impl Tier {
    /// Label written into the `aws-cdk:subnet-type` tag.
    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::PrivateWithEgress => "Private",
            Self::PrivateIsolated => "Isolated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::PrivateWithEgress => write!(f, "private_with_egress"),
            Self::PrivateIsolated => write!(f, "private_isolated"),
        }
    }
}

// ============================================================================
// Compute
// ============================================================================

/// Machine image selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MachineImage {
    /// Latest Amazon Linux 2023, resolved through the public SSM parameter
    #[default]
    LatestAmazonLinux2023,
    /// Region → image id map; the target region must be present
    Generic(IndexMap<String, String>),
}

/// Optional instance identity (role + instance profile) for fleet instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceIdentity {
    #[serde(default)]
    pub role_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub managed_policies: Vec<String>,
}

/// Fleet capacity bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Capacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            min: 1,
            desired: 2,
            max: 3,
        }
    }
}

impl Capacity {
    /// `min <= desired <= max` and at least one instance allowed.
    pub fn is_valid(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max && self.max >= 1
    }
}

/// Load-balancing definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Pre-existing TLS certificate for the HTTPS listener
    pub certificate_arn: String,

    /// Pre-existing key pair name
    pub key_pair: String,

    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    #[serde(default)]
    pub machine_image: MachineImage,

    /// Bootstrap commands run by each instance at boot
    #[serde(default)]
    pub bootstrap: Vec<String>,

    #[serde(default)]
    pub instance_identity: Option<InstanceIdentity>,

    #[serde(default)]
    pub capacity: Capacity,

    /// Target group health check path
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_instance_type() -> String {
    "t2.micro".to_string()
}

fn default_health_check_path() -> String {
    "/".to_string()
}

// ============================================================================
// Deployment
// ============================================================================

/// Deployment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub role: DeploymentRole,

    #[serde(default)]
    pub rollout: RolloutPolicy,
}

/// Service role used by the deployment group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentRole {
    /// Create a role scoped to the deployment service in the stack
    #[default]
    Managed,
    /// Reference a pre-existing role by ARN (not created here)
    ExternalArn(String),
}

/// Rollout policy across the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPolicy {
    #[default]
    AllAtOnce,
    HalfAtATime,
    OneAtATime,
}

impl RolloutPolicy {
    /// Predefined deployment configuration name.
    pub fn config_name(self) -> &'static str {
        match self {
            Self::AllAtOnce => "CodeDeployDefault.AllAtOnce",
            Self::HalfAtATime => "CodeDeployDefault.HalfAtATime",
            Self::OneAtATime => "CodeDeployDefault.OneAtATime",
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Database definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub engine: DatabaseEngine,

    /// Initial schema name
    pub database_name: String,

    #[serde(default = "default_db_instance_class")]
    pub instance_class: String,

    /// Storage in GiB
    #[serde(default = "default_allocated_storage")]
    pub allocated_storage: u32,

    #[serde(default = "default_master_username")]
    pub master_username: String,

    /// Where inbound database traffic may come from
    #[serde(default)]
    pub compute_boundary: ComputeBoundary,

    #[serde(default)]
    pub removal_policy: RemovalPolicy,

    #[serde(default)]
    pub delete_automated_backups: bool,

    #[serde(default)]
    pub deletion_protection: bool,
}

fn default_db_instance_class() -> String {
    "db.m5.large".to_string()
}

fn default_allocated_storage() -> u32 {
    100
}

fn default_master_username() -> String {
    "postgres".to_string()
}

/// Relational engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseEngine {
    #[default]
    Postgres,
    Mysql,
    Mariadb,
}

impl DatabaseEngine {
    pub fn port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql | Self::Mariadb => 3306,
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mysql => write!(f, "mysql"),
            Self::Mariadb => write!(f, "mariadb"),
        }
    }
}

/// Source of the compute boundary allowed into the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComputeBoundary {
    /// The boundary declared by the load-balancing stack
    #[default]
    FromLoadBalancer,
    /// A fixed, externally created security group id
    ExternalId(String),
}

/// What happens to a resource when its stack is torn down or it is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    Destroy,
    Retain,
    #[default]
    Snapshot,
}

impl RemovalPolicy {
    /// Value for `DeletionPolicy` / `UpdateReplacePolicy`.
    pub fn policy_value(self) -> &'static str {
        match self {
            Self::Destroy => "Delete",
            Self::Retain => "Retain",
            Self::Snapshot => "Snapshot",
        }
    }
}

// ============================================================================
// Bastion
// ============================================================================

/// Bastion definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BastionConfig {
    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    pub key_pair: String,

    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    #[serde(default)]
    pub machine_image: MachineImage,

    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// CIDR allowed on the administrative port
    #[serde(default = "default_admin_source")]
    pub admin_source: String,

    /// One host per zone; empty means every network zone
    #[serde(default)]
    pub zones: Vec<String>,
}

fn default_admin_port() -> u16 {
    22
}

fn default_admin_source() -> String {
    "0.0.0.0/0".to_string()
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Per-stack lock file written by `synth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackLock {
    /// Schema version
    pub schema: String,

    /// Stack name
    pub stack: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Template artifact path
    pub template_file: String,

    /// BLAKE3 of the template artifact
    pub template_hash: String,

    /// Per-resource state (template order)
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Resource type (e.g. `AWS::EC2::VPC`)
    #[serde(rename = "type")]
    pub resource_type: String,

    /// BLAKE3 of the resource's declaration
    pub hash: String,

    /// Immutable version number (launch templates only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub stack: String,
    pub logical_id: String,
    pub resource_type: String,
    pub action: PlanAction,
    pub description: String,
}

/// Full plan across all stacks.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// App name
    pub name: String,

    /// Changes, grouped by stack in deployment order
    pub changes: Vec<PlannedChange>,

    /// Stack deployment order
    pub deployment_order: Vec<String>,

    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    SynthStarted {
        app: String,
        run_id: String,
        generator_version: String,
    },
    StackSynthesized {
        stack: String,
        resources: u32,
        outputs: u32,
        hash: String,
    },
    StackRemoved {
        stack: String,
        template_file: String,
    },
    SynthCompleted {
        app: String,
        run_id: String,
        stacks: u32,
        total_seconds: f64,
    },
    DriftDetected {
        stack: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}
