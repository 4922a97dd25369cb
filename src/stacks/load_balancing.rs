//! Load-balancing definition: public load balancer, listeners, target group,
//! compute boundary, launch template and autoscaling fleet.
//!
//! Plain HTTP never reaches the fleet: both the default action and the
//! catch-all rule of the HTTP listener redirect permanently to HTTPS.

use super::network::NetworkHandle;
use super::{assume_role_policy, declare_boundary, resolve_image, Boundary, IngressRule, Peer};
use crate::core::app::{App, BoundarySource, Reference};
use crate::core::template::{self, CfnResource};
use crate::core::types::{Capacity, InfraConfig, InstanceIdentity, StackKind, Tier};
use crate::error::{InfraError, Result};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const MAX_RULE_PRIORITY: u32 = 50_000;

/// Listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Http,
    Https,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Https => write!(f, "HTTPS"),
        }
    }
}

/// What a listener or rule does with a matched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    Forward {
        target_group: Reference,
    },
    Redirect {
        protocol: ListenerProtocol,
        port: u16,
        permanent: bool,
    },
}

impl ListenerAction {
    /// Permanent redirect to HTTPS on 443.
    pub fn https_redirect() -> Self {
        Self::Redirect {
            protocol: ListenerProtocol::Https,
            port: HTTPS_PORT,
            permanent: true,
        }
    }

    pub fn forwards(&self) -> bool {
        matches!(self, Self::Forward { .. })
    }

    fn render(&self, app: &mut App, stack: &str) -> Result<Value> {
        match self {
            Self::Forward { target_group } => Ok(json!({
                "TargetGroupArn": app.resolve(stack, target_group)?,
                "Type": "forward",
            })),
            Self::Redirect {
                protocol,
                port,
                permanent,
            } => Ok(json!({
                "RedirectConfig": {
                    "Port": port.to_string(),
                    "Protocol": protocol.to_string(),
                    "StatusCode": if *permanent { "HTTP_301" } else { "HTTP_302" },
                },
                "Type": "redirect",
            })),
        }
    }
}

/// A path-matching rule on a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRule {
    pub name: String,
    pub priority: u32,
    pub path_patterns: Vec<String>,
    pub action: ListenerAction,
}

/// A listener and its rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub certificate_arn: Option<String>,
    pub default_action: ListenerAction,
    pub rules: Vec<ListenerRule>,
}

impl Listener {
    /// Encrypted listeners need a certificate; rule priorities are unique and
    /// in range.
    pub fn validate(&self) -> Result<()> {
        if self.protocol == ListenerProtocol::Https
            && self.certificate_arn.as_deref().is_none_or(str::is_empty)
        {
            return Err(InfraError::config(format!(
                "listener '{}' serves HTTPS without a certificate",
                self.name
            )));
        }
        let mut seen = Vec::new();
        for rule in &self.rules {
            if rule.priority == 0 || rule.priority > MAX_RULE_PRIORITY {
                return Err(InfraError::config(format!(
                    "rule '{}' priority {} outside 1..={}",
                    rule.name, rule.priority, MAX_RULE_PRIORITY
                )));
            }
            if seen.contains(&rule.priority) {
                return Err(InfraError::config(format!(
                    "listener '{}' has two rules at priority {}",
                    self.name, rule.priority
                )));
            }
            if rule.path_patterns.is_empty() {
                return Err(InfraError::config(format!(
                    "rule '{}' has no path patterns",
                    rule.name
                )));
            }
            seen.push(rule.priority);
        }
        Ok(())
    }
}

/// Read-only view of the load-balancing stack.
#[derive(Debug, Clone)]
pub struct LoadBalancingHandle {
    pub stack: String,
    pub load_balancer: Reference,
    pub load_balancer_dns: Reference,
    pub target_group: Reference,
    pub target_group_name: Reference,
    pub alb_boundary: Reference,
    pub compute_boundary: Reference,
    pub launch_template: Reference,
    pub launch_template_version: Reference,
    pub fleet: Reference,
    pub fleet_zones: Vec<String>,
    pub capacity: Capacity,
    pub listeners: Vec<Listener>,
}

fn declare_listener(
    app: &mut App,
    stack: &str,
    load_balancer: &Reference,
    listener: &Listener,
) -> Result<Reference> {
    listener.validate()?;
    let lb_arn = app.resolve(stack, load_balancer)?;
    let default_action = listener.default_action.render(app, stack)?;

    let mut props = json!({
        "DefaultActions": [default_action],
        "LoadBalancerArn": lb_arn,
        "Port": listener.port,
        "Protocol": listener.protocol.to_string(),
    });
    if let Some(arn) = &listener.certificate_arn {
        props["Certificates"] = json!([{ "CertificateArn": arn }]);
    }
    let listener_id = template::logical_id(&[&load_balancer.logical_id, &listener.name]);
    let listener_ref = app.stack_mut(stack)?.add_resource(
        &listener_id,
        CfnResource::new("AWS::ElasticLoadBalancingV2::Listener", props),
    )?;

    for rule in &listener.rules {
        let action = rule.action.render(app, stack)?;
        let rule_id = template::logical_id(&[&listener_id, &rule.name]);
        app.stack_mut(stack)?.add_resource(
            &rule_id,
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::ListenerRule",
                json!({
                    "Actions": [action],
                    "Conditions": [{
                        "Field": "path-pattern",
                        "PathPatternConfig": { "Values": rule.path_patterns },
                    }],
                    "ListenerArn": template::ref_(&listener_id),
                    "Priority": rule.priority,
                }),
            ),
        )?;
    }
    Ok(listener_ref)
}

fn policy_arn(policy: &str) -> String {
    if policy.starts_with("arn:") {
        policy.to_string()
    } else {
        format!("arn:aws:iam::aws:policy/{}", policy)
    }
}

/// Role + instance profile; returns the profile's `Arn` attribute.
fn declare_identity(
    app: &mut App,
    config: &InfraConfig,
    stack: &str,
    identity: &InstanceIdentity,
) -> Result<Reference> {
    let role_name = identity
        .role_name
        .clone()
        .unwrap_or_else(|| config.named("EC2InstanceProfile"));
    let role_id = template::logical_id(&[&config.named("EC2Role")]);
    let profile_id = template::logical_id(&[&config.named("EC2InstanceProfile")]);

    let mut role = json!({
        "AssumeRolePolicyDocument": assume_role_policy("ec2.amazonaws.com"),
        "ManagedPolicyArns": identity
            .managed_policies
            .iter()
            .map(|p| policy_arn(p))
            .collect::<Vec<_>>(),
        "RoleName": role_name,
    });
    if let Some(description) = &identity.description {
        role["Description"] = json!(description);
    }

    let s = app.stack_mut(stack)?;
    s.add_resource(&role_id, CfnResource::new("AWS::IAM::Role", role))?;
    s.add_resource(
        &profile_id,
        CfnResource::new(
            "AWS::IAM::InstanceProfile",
            json!({
                "InstanceProfileName": role_name,
                "Roles": [template::ref_(&role_id)],
            }),
        ),
    )?;
    Ok(Reference::attr(stack, &profile_id, "Arn"))
}

/// User data script: shebang plus one command per line.
pub fn render_user_data(commands: &[String]) -> String {
    let mut script = String::from("#!/bin/bash");
    for cmd in commands {
        script.push('\n');
        script.push_str(cmd);
    }
    script
}

/// Declare the load-balancing stack.
pub fn declare(app: &mut App, config: &InfraConfig, net: &NetworkHandle) -> Result<LoadBalancingHandle> {
    let lb = config
        .load_balancing
        .as_ref()
        .ok_or_else(|| InfraError::config("load_balancing is not configured"))?;
    if !lb.capacity.is_valid() {
        return Err(InfraError::config(format!(
            "fleet capacity must satisfy min <= desired <= max (got {}/{}/{})",
            lb.capacity.min, lb.capacity.desired, lb.capacity.max
        )));
    }

    let stack = config.stack_name(StackKind::LoadBalancing);
    let description = lb
        .description
        .clone()
        .unwrap_or_else(|| format!("{} ALB Stack", config.resource_prefix));
    app.add_stack(&stack, Some(description))?;

    let public = net.subnet_ids(Tier::Public, None)?;
    if public.len() < 2 {
        return Err(InfraError::MissingTier {
            network: net.name.clone(),
            tier: Tier::Public.to_string(),
            detail: " in at least two zones".to_string(),
        });
    }
    let fleet_subnets = net.select(Tier::PrivateWithEgress, None)?;
    let fleet_zones: Vec<String> = fleet_subnets.iter().map(|s| s.zone.clone()).collect();
    let fleet_subnet_ids: Vec<Reference> =
        fleet_subnets.iter().map(|s| s.subnet_id.clone()).collect();

    // Ingress boundary
    let alb_boundary = declare_boundary(
        app,
        &stack,
        &net.vpc_id,
        &Boundary {
            name: config.named("ALBSG"),
            allow_all_outbound: true,
            rules: vec![
                IngressRule::tcp(Peer::AnyIpv4, HTTP_PORT, "Allow HTTP traffic"),
                IngressRule::tcp(Peer::AnyIpv4, HTTPS_PORT, "Allow HTTPS traffic"),
            ],
        },
    )?;

    // Target group
    let tg_name = config.named("TargetGroup");
    let tg_id = template::logical_id(&[&tg_name]);
    let vpc = app.resolve(&stack, &net.vpc_id)?;
    let target_group = app.stack_mut(&stack)?.add_resource(
        &tg_id,
        CfnResource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            json!({
                "HealthCheckPath": lb.health_check_path,
                "Name": tg_name,
                "Port": HTTP_PORT,
                "Protocol": "HTTP",
                "TargetGroupAttributes": [{ "Key": "stickiness.enabled", "Value": "false" }],
                "TargetType": "instance",
                "VpcId": vpc,
            }),
        ),
    )?;

    // Load balancer
    let alb_name = config.named("ALB");
    let alb_id = template::logical_id(&[&alb_name]);
    let alb_sg = app.resolve(&stack, &alb_boundary)?;
    let public_ids = app.resolve_all(&stack, &public)?;
    let load_balancer = app.stack_mut(&stack)?.add_resource(
        &alb_id,
        CfnResource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
                "Name": alb_name,
                "Scheme": "internet-facing",
                "SecurityGroups": [alb_sg],
                "Subnets": public_ids,
                "Type": "application",
            }),
        ),
    )?;

    let listeners = vec![
        Listener {
            name: "HTTPListener".to_string(),
            port: HTTP_PORT,
            protocol: ListenerProtocol::Http,
            certificate_arn: None,
            default_action: ListenerAction::https_redirect(),
            rules: vec![ListenerRule {
                name: "HttpRedirectRule".to_string(),
                priority: 1,
                path_patterns: vec!["*".to_string()],
                action: ListenerAction::https_redirect(),
            }],
        },
        Listener {
            name: "HTTPSListener".to_string(),
            port: HTTPS_PORT,
            protocol: ListenerProtocol::Https,
            certificate_arn: Some(lb.certificate_arn.clone()),
            default_action: ListenerAction::Forward {
                target_group: target_group.clone(),
            },
            rules: Vec::new(),
        },
    ];
    for listener in &listeners {
        declare_listener(app, &stack, &load_balancer, listener)?;
    }

    // Compute boundary: inbound only from the load balancer's boundary
    let compute_boundary = declare_boundary(
        app,
        &stack,
        &net.vpc_id,
        &Boundary {
            name: config.named("EC2SG"),
            allow_all_outbound: true,
            rules: vec![IngressRule::tcp(
                Peer::Boundary(BoundarySource::Declared(alb_boundary.clone())),
                HTTP_PORT,
                "Allow HTTP traffic from ALB",
            )],
        },
    )?;

    // Launch template
    let profile = match &lb.instance_identity {
        Some(identity) => Some(declare_identity(app, config, &stack, identity)?),
        None => None,
    };
    let image_id = resolve_image(app, &stack, &lb.machine_image)?;
    let compute_sg = app.resolve(&stack, &compute_boundary)?;
    let lt_name = config.named("EC2LaunchTemplate");
    let lt_id = template::logical_id(&[&lt_name]);
    let mut data = json!({
        "ImageId": image_id,
        "InstanceType": lb.instance_type,
        "KeyName": lb.key_pair,
        "SecurityGroupIds": [compute_sg],
        "TagSpecifications": [
            { "ResourceType": "instance", "Tags": template::name_tag(&lt_name) },
            { "ResourceType": "volume", "Tags": template::name_tag(&lt_name) },
        ],
        "UserData": template::base64(Value::String(render_user_data(&lb.bootstrap))),
    });
    if let Some(profile) = &profile {
        data["IamInstanceProfile"] = json!({ "Arn": app.resolve(&stack, profile)? });
    }
    let launch_template = app.stack_mut(&stack)?.add_resource(
        &lt_id,
        CfnResource::new(
            "AWS::EC2::LaunchTemplate",
            json!({
                "LaunchTemplateData": data,
                "LaunchTemplateName": lt_name,
                "TagSpecifications": [{
                    "ResourceType": "launch-template",
                    "Tags": template::name_tag(&lt_name),
                }],
            }),
        ),
    )?;
    let launch_template_version = Reference::attr(&stack, &lt_id, "LatestVersionNumber");

    // Fleet
    let asg_name = config.named("ASG");
    let asg_id = template::logical_id(&[&asg_name]);
    let subnets = app.resolve_all(&stack, &fleet_subnet_ids)?;
    let tg_arn = app.resolve(&stack, &target_group)?;
    let lt_version = app.resolve(&stack, &launch_template_version)?;
    let fleet = app.stack_mut(&stack)?.add_resource(
        &asg_id,
        CfnResource::new(
            "AWS::AutoScaling::AutoScalingGroup",
            json!({
                "AutoScalingGroupName": asg_name,
                "DesiredCapacity": lb.capacity.desired.to_string(),
                "LaunchTemplate": {
                    "LaunchTemplateId": template::ref_(&lt_id),
                    "Version": lt_version,
                },
                "MaxSize": lb.capacity.max.to_string(),
                "MinSize": lb.capacity.min.to_string(),
                "TargetGroupARNs": [tg_arn],
                "VPCZoneIdentifier": subnets,
            }),
        )
        .with_update_policy(json!({
            "AutoScalingScheduledAction": { "IgnoreUnmodifiedGroupSizeProperties": true }
        })),
    )?;

    let load_balancer_dns = Reference::attr(&stack, &alb_id, "DNSName");
    let dns_output = config.named("ALBDNSName");
    let version_output = config.named("EC2TemplateVersion");
    let dns = app.resolve(&stack, &load_balancer_dns)?;
    let s = app.stack_mut(&stack)?;
    s.add_output(&dns_output, dns, Some(&dns_output));
    s.add_output(
        &version_output,
        template::get_att(&lt_id, "LatestVersionNumber"),
        Some(&version_output),
    );

    info!(
        stack = %stack,
        zones = ?fleet_zones,
        min = lb.capacity.min,
        desired = lb.capacity.desired,
        max = lb.capacity.max,
        "declared load balancer and fleet"
    );

    Ok(LoadBalancingHandle {
        target_group_name: Reference::attr(&stack, &tg_id, "TargetGroupName"),
        stack,
        load_balancer,
        load_balancer_dns,
        target_group,
        alb_boundary,
        compute_boundary,
        launch_template,
        launch_template_version,
        fleet,
        fleet_zones,
        capacity: lb.capacity,
        listeners,
    })
}
