//! Stack definitions: one module per stack, plus shared declaration helpers.
//!
//! Each definition has the same shape: `declare(app, config, handles...)`
//! adds one stack to the [`App`], declares its resources, and returns a handle
//! of read-only [`Reference`]s for downstream definitions.

pub mod bastion;
pub mod database;
pub mod deployment;
pub mod load_balancing;
pub mod network;

use crate::core::app::{App, BoundarySource, Reference};
use crate::core::template::{self, CfnResource, Parameter};
use crate::core::types::MachineImage;
use crate::error::{InfraError, Result};
use serde_json::{json, Value};

const AL2023_SSM_PATH: &str = "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64";
const AL2023_PARAMETER: &str = "SsmParameterValueAmazonLinux2023AmiParameter";

/// Source of an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    AnyIpv4,
    Cidr(String),
    Boundary(BoundarySource),
}

impl Peer {
    fn label(&self) -> String {
        match self {
            Self::AnyIpv4 => "0.0.0.0/0".to_string(),
            Self::Cidr(c) => c.clone(),
            Self::Boundary(BoundarySource::Declared(r)) => format!("{}{}", r.stack, r.logical_id),
            Self::Boundary(BoundarySource::External(id)) => id.clone(),
        }
    }
}

/// A TCP allow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

impl IngressRule {
    pub fn tcp(peer: Peer, port: u16, description: &str) -> Self {
        Self {
            peer,
            port,
            description: description.to_string(),
        }
    }
}

/// A security boundary to declare.
#[derive(Debug, Clone)]
pub struct Boundary {
    /// Construct id and physical group name
    pub name: String,
    pub allow_all_outbound: bool,
    pub rules: Vec<IngressRule>,
}

/// Declare a security group in `stack` and return a `GroupId` reference.
///
/// CIDR rules are inlined; rules whose source is another boundary become
/// separate `AWS::EC2::SecurityGroupIngress` resources so the source group is
/// referenced, never copied.
pub fn declare_boundary(
    app: &mut App,
    stack: &str,
    vpc: &Reference,
    boundary: &Boundary,
) -> Result<Reference> {
    let vpc_id = app.resolve(stack, vpc)?;
    let sg_id = template::logical_id(&[&boundary.name]);

    let mut inline = Vec::new();
    let mut peered = Vec::new();
    for rule in &boundary.rules {
        match &rule.peer {
            Peer::AnyIpv4 | Peer::Cidr(_) => inline.push(json!({
                "CidrIp": rule.peer.label(),
                "Description": rule.description,
                "FromPort": rule.port,
                "IpProtocol": "tcp",
                "ToPort": rule.port,
            })),
            Peer::Boundary(source) => peered.push((rule, source)),
        }
    }

    let egress = if boundary.allow_all_outbound {
        json!([{
            "CidrIp": "0.0.0.0/0",
            "Description": "Allow all outbound traffic by default",
            "IpProtocol": "-1",
        }])
    } else {
        json!([{
            "CidrIp": "255.255.255.255/32",
            "Description": "Disallow all traffic",
            "FromPort": 252,
            "IpProtocol": "icmp",
            "ToPort": 86,
        }])
    };

    let mut props = json!({
        "GroupDescription": format!("{}/{}", stack, boundary.name),
        "GroupName": boundary.name,
        "SecurityGroupEgress": egress,
        "VpcId": vpc_id,
    });
    if !inline.is_empty() {
        props["SecurityGroupIngress"] = Value::Array(inline);
    }
    app.stack_mut(stack)?
        .add_resource(&sg_id, CfnResource::new("AWS::EC2::SecurityGroup", props))?;
    let group = Reference::attr(stack, &sg_id, "GroupId");

    for (rule, source) in peered {
        let source_id = app.resolve_boundary(stack, source)?;
        let group_id = app.resolve(stack, &group)?;
        let port = rule.port.to_string();
        let ingress_id = template::logical_id(&[
            &boundary.name,
            "from",
            &rule.peer.label(),
            &port,
        ]);
        app.stack_mut(stack)?.add_resource(
            &ingress_id,
            CfnResource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "Description": rule.description,
                    "FromPort": rule.port,
                    "GroupId": group_id,
                    "IpProtocol": "tcp",
                    "SourceSecurityGroupId": source_id,
                    "ToPort": rule.port,
                }),
            ),
        )?;
    }

    Ok(group)
}

/// Resolve a machine image to an `ImageId` value for `stack`.
pub fn resolve_image(app: &mut App, stack: &str, image: &MachineImage) -> Result<Value> {
    match image {
        MachineImage::LatestAmazonLinux2023 => {
            let param = app.stack_mut(stack)?.add_parameter(
                AL2023_PARAMETER,
                Parameter {
                    parameter_type: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
                    default: Some(AL2023_SSM_PATH.to_string()),
                    description: None,
                },
            );
            app.resolve(stack, &param)
        }
        MachineImage::Generic(by_region) => {
            let region = app.env.region.clone();
            by_region
                .get(&region)
                .map(|ami| Value::String(ami.clone()))
                .ok_or_else(|| {
                    InfraError::config(format!(
                        "stack '{}': machine image has no entry for region '{}'",
                        stack, region
                    ))
                })
        }
    }
}

/// Trust policy letting a service principal assume a role.
pub fn assume_role_policy(service: &str) -> Value {
    json!({
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": service },
        }],
        "Version": "2012-10-17",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Environment;
    use indexmap::IndexMap;

    fn app_with_vpc() -> (App, Reference) {
        let mut app = App::new(
            "t",
            Environment {
                account: None,
                region: "ap-southeast-1".to_string(),
            },
        );
        app.add_stack("Net", None).unwrap();
        app.add_stack("Web", None).unwrap();
        let vpc = app
            .stack_mut("Net")
            .unwrap()
            .add_resource("Vpc", CfnResource::new("AWS::EC2::VPC", json!({})))
            .unwrap();
        (app, vpc)
    }

    #[test]
    fn test_boundary_inline_cidr_rules() {
        let (mut app, vpc) = app_with_vpc();
        let sg = declare_boundary(
            &mut app,
            "Web",
            &vpc,
            &Boundary {
                name: "WebSG".to_string(),
                allow_all_outbound: true,
                rules: vec![
                    IngressRule::tcp(Peer::AnyIpv4, 80, "http"),
                    IngressRule::tcp(Peer::AnyIpv4, 443, "https"),
                ],
            },
        )
        .unwrap();
        let t = &app.stack("Web").unwrap().template;
        let res = &t.resources[&sg.logical_id];
        let ingress = res.prop("SecurityGroupIngress").unwrap().as_array().unwrap();
        assert_eq!(ingress.len(), 2);
        assert_eq!(ingress[1]["FromPort"], 443);
        assert_eq!(res.prop("SecurityGroupEgress").unwrap()[0]["IpProtocol"], "-1");
        assert_eq!(t.resources_of_type("AWS::EC2::SecurityGroupIngress").count(), 0);
    }

    #[test]
    fn test_boundary_peer_rule_is_separate_resource() {
        let (mut app, vpc) = app_with_vpc();
        let source = declare_boundary(
            &mut app,
            "Web",
            &vpc,
            &Boundary {
                name: "LbSG".to_string(),
                allow_all_outbound: true,
                rules: vec![],
            },
        )
        .unwrap();
        let target = declare_boundary(
            &mut app,
            "Web",
            &vpc,
            &Boundary {
                name: "AppSG".to_string(),
                allow_all_outbound: false,
                rules: vec![IngressRule::tcp(
                    Peer::Boundary(BoundarySource::Declared(source.clone())),
                    80,
                    "from lb",
                )],
            },
        )
        .unwrap();
        let t = &app.stack("Web").unwrap().template;
        assert!(t.resources[&target.logical_id].prop("SecurityGroupIngress").is_none());
        let rules: Vec<_> = t.resources_of_type("AWS::EC2::SecurityGroupIngress").collect();
        assert_eq!(rules.len(), 1);
        let props = &rules[0].1.properties;
        assert_eq!(
            props["SourceSecurityGroupId"],
            json!({ "Fn::GetAtt": [source.logical_id, "GroupId"] })
        );
        assert_eq!(
            t.resources[&target.logical_id].prop("SecurityGroupEgress").unwrap()[0]["CidrIp"],
            "255.255.255.255/32"
        );
    }

    #[test]
    fn test_resolve_generic_image() {
        let (mut app, _) = app_with_vpc();
        let mut map = IndexMap::new();
        map.insert("ap-southeast-1".to_string(), "ami-123".to_string());
        let v = resolve_image(&mut app, "Web", &MachineImage::Generic(map)).unwrap();
        assert_eq!(v, json!("ami-123"));
    }

    #[test]
    fn test_resolve_generic_image_missing_region() {
        let (mut app, _) = app_with_vpc();
        let mut map = IndexMap::new();
        map.insert("us-east-1".to_string(), "ami-123".to_string());
        let err = resolve_image(&mut app, "Web", &MachineImage::Generic(map)).unwrap_err();
        assert!(err.to_string().contains("ap-southeast-1"));
    }

    #[test]
    fn test_resolve_latest_image_adds_parameter() {
        let (mut app, _) = app_with_vpc();
        let v = resolve_image(&mut app, "Web", &MachineImage::LatestAmazonLinux2023).unwrap();
        assert_eq!(v, json!({ "Ref": AL2023_PARAMETER }));
        let p = &app.stack("Web").unwrap().template.parameters[AL2023_PARAMETER];
        assert_eq!(p.default.as_deref(), Some(AL2023_SSM_PATH));
    }
}
