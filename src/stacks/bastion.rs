//! Bastion definition: one jump host per zone in the public tier.

use super::network::NetworkHandle;
use super::{declare_boundary, resolve_image, Boundary, IngressRule, Peer};
use crate::core::app::{App, Reference};
use crate::core::template::{self, CfnResource};
use crate::core::types::{InfraConfig, StackKind, Tier};
use crate::error::{InfraError, Result};
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BastionHost {
    pub name: String,
    pub zone: String,
    pub instance: Reference,
}

#[derive(Debug, Clone)]
pub struct BastionHandle {
    pub stack: String,
    pub boundary: Reference,
    pub hosts: Vec<BastionHost>,
}

/// Declare the bastion stack.
pub fn declare(app: &mut App, config: &InfraConfig, net: &NetworkHandle) -> Result<BastionHandle> {
    let bc = config
        .bastion
        .as_ref()
        .ok_or_else(|| InfraError::config("bastion is not configured"))?;
    let stack = config.stack_name(StackKind::Bastion);
    let description = bc
        .description
        .clone()
        .unwrap_or_else(|| format!("{} Bastion Host Stack", config.resource_prefix));
    app.add_stack(&stack, Some(description))?;

    let zones = if bc.zones.is_empty() {
        net.zones.clone()
    } else {
        bc.zones.clone()
    };

    let peer = if bc.admin_source == "0.0.0.0/0" {
        Peer::AnyIpv4
    } else {
        Peer::Cidr(bc.admin_source.clone())
    };
    let boundary = declare_boundary(
        app,
        &stack,
        &net.vpc_id,
        &Boundary {
            name: config.named("BastionHostSG"),
            allow_all_outbound: true,
            rules: vec![IngressRule::tcp(peer, bc.admin_port, "Allow SSH traffic")],
        },
    )?;

    let image = resolve_image(app, &stack, &bc.machine_image)?;
    let sg = app.resolve(&stack, &boundary)?;
    let mut hosts = Vec::with_capacity(zones.len());
    for (i, zone) in zones.iter().enumerate() {
        let placement = net.select(Tier::Public, Some(std::slice::from_ref(zone)))?;
        let subnet = app.resolve(&stack, &placement[0].subnet_id)?;
        let name = config.named(&format!("BastionHost{}", i + 1));
        let id = template::logical_id(&[&name]);
        let instance = app.stack_mut(&stack)?.add_resource(
            &id,
            CfnResource::new(
                "AWS::EC2::Instance",
                json!({
                    "AvailabilityZone": zone,
                    "ImageId": image,
                    "InstanceType": bc.instance_type,
                    "KeyName": bc.key_pair,
                    "SecurityGroupIds": [sg],
                    "SubnetId": subnet,
                    "Tags": template::name_tag(&name),
                }),
            ),
        )?;
        hosts.push(BastionHost {
            name,
            zone: zone.clone(),
            instance,
        });
    }

    info!(stack = %stack, hosts = hosts.len(), port = bc.admin_port, "declared bastion hosts");
    Ok(BastionHandle {
        stack,
        boundary,
        hosts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser;
    use crate::core::types::Environment;
    use crate::stacks::network;

    const CONFIG: &str = r#"
version: "1.0"
name: median
network:
  availability_zones: [ap-southeast-1a, ap-southeast-1b]
bastion:
  key_pair: median-key-pair
"#;

    fn build(yaml: &str) -> Result<(App, NetworkHandle, BastionHandle)> {
        let config: InfraConfig = parser::parse_config(yaml).unwrap();
        let mut app = App::new(
            "median",
            Environment {
                account: None,
                region: "ap-southeast-1".to_string(),
            },
        );
        let net = network::declare(&mut app, &config)?;
        let bastion = declare(&mut app, &config, &net)?;
        Ok((app, net, bastion))
    }

    #[test]
    fn test_one_host_per_zone_in_public_tier() {
        let (app, net, b) = build(CONFIG).unwrap();
        assert_eq!(b.hosts.len(), 2);
        assert_eq!(b.hosts[0].name, "MedianBastionHost1");
        assert_eq!(b.hosts[1].zone, "ap-southeast-1b");

        let t = &app.stack(&b.stack).unwrap().template;
        for host in &b.hosts {
            let inst = &t.resources[&host.instance.logical_id];
            let export = inst.prop("SubnetId").unwrap()["Fn::ImportValue"].as_str().unwrap();
            let zone = vec![host.zone.clone()];
            let public = net.select(Tier::Public, Some(&zone)).unwrap();
            assert_eq!(
                app.export_value(export).unwrap().1,
                &template::ref_(&public[0].subnet_id.logical_id)
            );
            assert_eq!(inst.prop("KeyName").unwrap(), "median-key-pair");
            assert_eq!(inst.prop("InstanceType").unwrap(), "t2.micro");
        }
    }

    #[test]
    fn test_admin_rule() {
        let (app, _, b) = build(CONFIG).unwrap();
        let t = &app.stack(&b.stack).unwrap().template;
        let sg = &t.resources[&b.boundary.logical_id];
        let ingress = sg.prop("SecurityGroupIngress").unwrap().as_array().unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0]["CidrIp"], "0.0.0.0/0");
        assert_eq!(ingress[0]["FromPort"], 22);
    }

    #[test]
    fn test_restricted_source_and_explicit_zone() {
        let yaml = format!("{}  admin_source: 203.0.113.0/24\n  zones: [ap-southeast-1b]\n", CONFIG);
        let (app, _, b) = build(&yaml).unwrap();
        assert_eq!(b.hosts.len(), 1);
        assert_eq!(b.hosts[0].zone, "ap-southeast-1b");
        let t = &app.stack(&b.stack).unwrap().template;
        let sg = &t.resources[&b.boundary.logical_id];
        assert_eq!(sg.prop("SecurityGroupIngress").unwrap()[0]["CidrIp"], "203.0.113.0/24");
    }

    #[test]
    fn test_unknown_zone_rejected() {
        let yaml = format!("{}  zones: [ap-southeast-1c]\n", CONFIG);
        assert!(matches!(build(&yaml), Err(InfraError::MissingTier { .. })));
    }

    #[test]
    fn test_latest_image_parameter() {
        let (app, _, b) = build(CONFIG).unwrap();
        let t = &app.stack(&b.stack).unwrap().template;
        assert_eq!(t.parameters.len(), 1);
        let inst = &t.resources[&b.hosts[0].instance.logical_id];
        assert!(inst.prop("ImageId").unwrap().get("Ref").is_some());
    }
}
