//! Database definition: access boundary, subnet group over the isolated tier,
//! generated credentials and the managed instance.

use super::network::NetworkHandle;
use super::{declare_boundary, Boundary, IngressRule, Peer};
use crate::core::app::{App, BoundarySource, Reference};
use crate::core::template::{self, CfnResource};
use crate::core::types::{DatabaseEngine, InfraConfig, StackKind, Tier};
use crate::error::{InfraError, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

const SECRET_EXCLUDE: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

fn engine_title(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::Postgres => "Postgres",
        DatabaseEngine::Mysql => "Mysql",
        DatabaseEngine::Mariadb => "Mariadb",
    }
}

/// `{{resolve:secretsmanager:<secret>:SecretString:<key>::}}`
fn secret_field(secret_id: &str, key: &str) -> Value {
    template::join(
        "",
        vec![
            json!("{{resolve:secretsmanager:"),
            template::ref_(secret_id),
            json!(format!(":SecretString:{}::}}}}", key)),
        ],
    )
}

#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    pub stack: String,
    pub boundary: Reference,
    pub instance: Reference,
    pub endpoint: Reference,
    pub port: u16,
    pub secret: Reference,
    pub zones: Vec<String>,
}

/// Declare the database stack; `compute` is the only source allowed in.
pub fn declare(
    app: &mut App,
    config: &InfraConfig,
    net: &NetworkHandle,
    compute: BoundarySource,
) -> Result<DatabaseHandle> {
    let db = config
        .database
        .as_ref()
        .ok_or_else(|| InfraError::config("database is not configured"))?;
    let stack = config.stack_name(StackKind::Database);
    let description = db
        .description
        .clone()
        .unwrap_or_else(|| format!("{} RDS Stack", config.resource_prefix));
    app.add_stack(&stack, Some(description))?;

    let isolated = net.select(Tier::PrivateIsolated, None)?;
    let zones: Vec<String> = isolated.iter().map(|s| s.zone.clone()).collect();
    let isolated_ids: Vec<Reference> = isolated.iter().map(|s| s.subnet_id.clone()).collect();

    if let BoundarySource::External(id) = &compute {
        warn!(stack = %stack, group = %id, "database admits an externally managed boundary");
    }

    let title = engine_title(db.engine);
    let port = db.engine.port();
    let boundary = declare_boundary(
        app,
        &stack,
        &net.vpc_id,
        &Boundary {
            name: config.named(&format!("{}SG", title)),
            allow_all_outbound: true,
            rules: vec![IngressRule::tcp(
                Peer::Boundary(compute),
                port,
                "Allow EC2 to connect to RDS",
            )],
        },
    )?;

    let instance_name = config.named(&format!("{}RDS", title));
    let subnet_group_id = template::logical_id(&[&instance_name, "SubnetGroup"]);
    let secret_id = template::logical_id(&[&instance_name, "Secret"]);
    let instance_id = template::logical_id(&[&instance_name]);
    let attachment_id = template::logical_id(&[&instance_name, "SecretAttachment"]);

    let subnets = app.resolve_all(&stack, &isolated_ids)?;
    let sg = app.resolve(&stack, &boundary)?;
    let s = app.stack_mut(&stack)?;
    s.add_resource(
        &subnet_group_id,
        CfnResource::new(
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": format!("Subnet group for {} database", instance_name),
                "SubnetIds": subnets,
            }),
        ),
    )?;
    let secret = s.add_resource(
        &secret_id,
        CfnResource::new(
            "AWS::SecretsManager::Secret",
            json!({
                "Description": format!("Generated credentials for {}", instance_name),
                "GenerateSecretString": {
                    "ExcludeCharacters": SECRET_EXCLUDE,
                    "GenerateStringKey": "password",
                    "PasswordLength": 30,
                    "SecretStringTemplate": json!({ "username": db.master_username }).to_string(),
                },
            }),
        )
        .with_removal("Delete"),
    )?;

    let policy = db.removal_policy.policy_value();
    let instance = s.add_resource(
        &instance_id,
        CfnResource::new(
            "AWS::RDS::DBInstance",
            json!({
                "AllocatedStorage": db.allocated_storage.to_string(),
                "CopyTagsToSnapshot": true,
                "DBInstanceClass": db.instance_class,
                "DBName": db.database_name,
                "DBSubnetGroupName": template::ref_(&subnet_group_id),
                "DeleteAutomatedBackups": db.delete_automated_backups,
                "DeletionProtection": db.deletion_protection,
                "Engine": db.engine.to_string(),
                "MasterUsername": secret_field(&secret_id, "username"),
                "MasterUserPassword": secret_field(&secret_id, "password"),
                "Port": port.to_string(),
                "PubliclyAccessible": false,
                "StorageType": "gp2",
                "VPCSecurityGroups": [sg],
            }),
        )
        .with_removal(policy),
    )?;
    s.add_resource(
        &attachment_id,
        CfnResource::new(
            "AWS::SecretsManager::SecretTargetAttachment",
            json!({
                "SecretId": template::ref_(&secret_id),
                "TargetId": template::ref_(&instance_id),
                "TargetType": "AWS::RDS::DBInstance",
            }),
        ),
    )?;

    let endpoint = Reference::attr(&stack, &instance_id, "Endpoint.Address");
    let output = config.named(&format!("{}RdsEndpoint", title));
    s.add_output(
        &output,
        template::get_att(&instance_id, "Endpoint.Address"),
        Some(&output),
    );

    info!(stack = %stack, engine = %db.engine, removal = policy, "declared database");
    Ok(DatabaseHandle {
        stack,
        boundary,
        instance,
        endpoint,
        port,
        secret,
        zones,
    })
}
