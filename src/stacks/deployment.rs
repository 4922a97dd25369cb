//! Deployment definition: application and in-place deployment group bound to
//! the fleet behind the load balancer.

use super::assume_role_policy;
use super::load_balancing::LoadBalancingHandle;
use crate::core::app::{App, Reference};
use crate::core::template::{self, CfnResource};
use crate::core::types::{DeploymentRole, InfraConfig, RolloutPolicy, StackKind};
use crate::error::{InfraError, Result};
use serde_json::json;
use tracing::{info, warn};

const DEPLOY_SERVICE_POLICY: &str = "arn:aws:iam::aws:policy/service-role/AWSCodeDeployRole";

/// One fleet, one load balancer, one target group and a rollout policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentBinding {
    pub fleet: Reference,
    pub load_balancer: Reference,
    pub target_group_name: Reference,
    pub rollout: RolloutPolicy,
}

impl DeploymentBinding {
    pub fn from_load_balancing(lb: &LoadBalancingHandle, rollout: RolloutPolicy) -> Self {
        Self {
            fleet: lb.fleet.clone(),
            load_balancer: lb.load_balancer.clone(),
            target_group_name: lb.target_group_name.clone(),
            rollout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentHandle {
    pub stack: String,
    pub application: Reference,
    pub group: Reference,
    pub binding: DeploymentBinding,
}

/// Declare the deployment stack for an existing binding.
pub fn declare(app: &mut App, config: &InfraConfig, binding: DeploymentBinding) -> Result<DeploymentHandle> {
    let dc = config
        .deployment
        .as_ref()
        .ok_or_else(|| InfraError::config("deployment is not configured"))?;
    let stack = config.stack_name(StackKind::Deployment);
    let description = dc
        .description
        .clone()
        .unwrap_or_else(|| format!("{} Codedeploy Stack", config.resource_prefix));
    app.add_stack(&stack, Some(description))?;

    // The group binds through the target group; the load balancer itself only
    // orders the stacks.
    app.add_dependency(&stack, &binding.load_balancer.stack)?;

    let app_name = config.named("CodedeployApplication");
    let app_id = template::logical_id(&[&app_name]);
    let application = app.stack_mut(&stack)?.add_resource(
        &app_id,
        CfnResource::new(
            "AWS::CodeDeploy::Application",
            json!({ "ApplicationName": app_name, "ComputePlatform": "Server" }),
        ),
    )?;

    let service_role = match &dc.role {
        DeploymentRole::ExternalArn(arn) => {
            warn!(stack = %stack, role = %arn, "deployment group uses an externally managed role");
            json!(arn)
        }
        DeploymentRole::Managed => {
            let role_id = template::logical_id(&[&config.named("CodedeployRole")]);
            let role = app.stack_mut(&stack)?.add_resource(
                &role_id,
                CfnResource::new(
                    "AWS::IAM::Role",
                    json!({
                        "AssumeRolePolicyDocument": assume_role_policy("codedeploy.amazonaws.com"),
                        "ManagedPolicyArns": [DEPLOY_SERVICE_POLICY],
                    }),
                ),
            )?;
            app.resolve(&stack, &Reference::attr(&role.stack, &role.logical_id, "Arn"))?
        }
    };

    let fleet = app.resolve(&stack, &binding.fleet)?;
    let target_group = app.resolve(&stack, &binding.target_group_name)?;
    let group_name = config.named("ServerDeploymentGroup");
    let group_id = template::logical_id(&[&group_name]);
    let group = app.stack_mut(&stack)?.add_resource(
        &group_id,
        CfnResource::new(
            "AWS::CodeDeploy::DeploymentGroup",
            json!({
                "ApplicationName": template::ref_(&app_id),
                "AutoRollbackConfiguration": {
                    "Enabled": true,
                    "Events": ["DEPLOYMENT_FAILURE"],
                },
                "AutoScalingGroups": [fleet],
                "DeploymentConfigName": binding.rollout.config_name(),
                "DeploymentGroupName": group_name,
                "DeploymentStyle": {
                    "DeploymentOption": "WITH_TRAFFIC_CONTROL",
                    "DeploymentType": "IN_PLACE",
                },
                "LoadBalancerInfo": {
                    "TargetGroupInfoList": [{ "Name": target_group }],
                },
                "ServiceRoleArn": service_role,
            }),
        ),
    )?;

    let s = app.stack_mut(&stack)?;
    s.add_output(
        &config.named("CodedeployApplicationName"),
        template::ref_(&app_id),
        None,
    );
    s.add_output(
        &config.named("CodedeployDeploymentGroupName"),
        template::ref_(&group_id),
        None,
    );

    info!(stack = %stack, rollout = binding.rollout.config_name(), "declared deployment group");
    Ok(DeploymentHandle {
        stack,
        application,
        group,
        binding,
    })
}
