//! Network definition: VPC, per-zone subnets per segment, gateways, routes.

use crate::core::app::{App, Reference};
use crate::core::cidr::{Ipv4Cidr, SubnetAllocator};
use crate::core::template::{self, CfnResource};
use crate::core::types::{InfraConfig, StackKind, SubnetSpec, Tier};
use crate::error::{InfraError, Result};
use serde_json::{json, Value};
use tracing::info;

/// One declared subnet.
#[derive(Debug, Clone)]
pub struct SubnetHandle {
    /// Segment name (e.g. "private")
    pub segment: String,
    pub tier: Tier,
    pub zone: String,
    pub cidr: Ipv4Cidr,
    pub subnet_id: Reference,
    pub route_table_id: Reference,
}

/// Read-only view of the declared network.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub stack: String,
    pub name: String,
    pub cidr: Ipv4Cidr,
    pub vpc_id: Reference,
    pub zones: Vec<String>,
    pub subnets: Vec<SubnetHandle>,
}

impl NetworkHandle {
    /// Distinct tiers, in declaration order.
    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers = Vec::new();
        for s in &self.subnets {
            if !tiers.contains(&s.tier) {
                tiers.push(s.tier);
            }
        }
        tiers
    }

    /// Subnets of the first segment with `tier`, restricted to `zones` when
    /// given. Errors if nothing matches.
    pub fn select(&self, tier: Tier, zones: Option<&[String]>) -> Result<Vec<&SubnetHandle>> {
        let segment = self
            .subnets
            .iter()
            .find(|s| s.tier == tier)
            .map(|s| s.segment.as_str())
            .ok_or_else(|| InfraError::MissingTier {
                network: self.name.clone(),
                tier: tier.to_string(),
                detail: String::new(),
            })?;
        let selected: Vec<&SubnetHandle> = self
            .subnets
            .iter()
            .filter(|s| s.segment == segment)
            .filter(|s| zones.is_none_or(|z| z.contains(&s.zone)))
            .collect();
        if selected.is_empty() {
            return Err(InfraError::MissingTier {
                network: self.name.clone(),
                tier: tier.to_string(),
                detail: format!(" in zones {:?}", zones.unwrap_or_default()),
            });
        }
        Ok(selected)
    }

    /// Subnet-id references for a selection.
    pub fn subnet_ids(&self, tier: Tier, zones: Option<&[String]>) -> Result<Vec<Reference>> {
        Ok(self
            .select(tier, zones)?
            .into_iter()
            .map(|s| s.subnet_id.clone())
            .collect())
    }
}

struct PlannedSubnet<'a> {
    spec: &'a SubnetSpec,
    zone: &'a str,
    zone_index: usize,
    cidr: Ipv4Cidr,
    path: String,
}

impl PlannedSubnet<'_> {
    fn id(&self, vpc_name: &str, leaf: &str) -> String {
        template::logical_id(&[vpc_name, &self.path, leaf])
    }
}

fn tags(entries: &[(&str, &str)]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect(),
    )
}

/// Declare the network stack.
pub fn declare(app: &mut App, config: &InfraConfig) -> Result<NetworkHandle> {
    let net = &config.network;
    let stack = config.stack_name(StackKind::Network);
    let description = net
        .description
        .clone()
        .unwrap_or_else(|| format!("{} VPC Stack", config.resource_prefix));
    app.add_stack(&stack, Some(description))?;

    let vpc_name = net.vpc_name.clone().unwrap_or_else(|| config.named("VPC"));
    let space: Ipv4Cidr = net.cidr.parse()?;
    if net.availability_zones.is_empty() {
        return Err(InfraError::config("network needs at least one availability zone"));
    }

    // Allocate every block up front so routes can name NATs declared later.
    let mut alloc = SubnetAllocator::new(space);
    let mut planned = Vec::new();
    for spec in &net.subnets {
        for (i, zone) in net.availability_zones.iter().enumerate() {
            planned.push(PlannedSubnet {
                spec,
                zone,
                zone_index: i,
                cidr: alloc.allocate(spec.cidr_mask)?,
                path: format!("{}Subnet{}", spec.name, i + 1),
            });
        }
    }

    let nat_segment = net
        .subnets
        .iter()
        .find(|s| s.tier == Tier::Public)
        .map(|s| s.name.clone());
    let zone_count = net.availability_zones.len();
    let nat_count = match nat_segment {
        Some(_) => net
            .nat_gateways
            .map_or(zone_count, |n| usize::try_from(n).unwrap_or(zone_count))
            .min(zone_count),
        None => 0,
    };
    let needs_egress = planned
        .iter()
        .any(|p| p.spec.tier == Tier::PrivateWithEgress);
    if needs_egress && nat_count == 0 {
        return Err(InfraError::config(
            "private_with_egress subnets need a public segment and at least one NAT gateway",
        ));
    }
    let nat_ids: Vec<String> = planned
        .iter()
        .filter(|p| Some(&p.spec.name) == nat_segment.as_ref() && p.zone_index < nat_count)
        .map(|p| p.id(&vpc_name, "NATGateway"))
        .collect();

    let vpc_id = template::logical_id(&[&vpc_name]);
    let s = app.stack_mut(&stack)?;
    let vpc = s.add_resource(
        &vpc_id,
        CfnResource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": space.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": template::name_tag(&vpc_name),
            }),
        ),
    )?;

    let igw_id = template::logical_id(&[&vpc_name, "IGW"]);
    let attach_id = template::logical_id(&[&vpc_name, "VPCGW"]);
    if nat_segment.is_some() {
        s.add_resource(
            &igw_id,
            CfnResource::new(
                "AWS::EC2::InternetGateway",
                json!({ "Tags": template::name_tag(&vpc_name) }),
            ),
        )?;
        s.add_resource(
            &attach_id,
            CfnResource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({
                    "InternetGatewayId": template::ref_(&igw_id),
                    "VpcId": template::ref_(&vpc_id),
                }),
            ),
        )?;
    }

    let mut subnets = Vec::with_capacity(planned.len());
    for p in &planned {
        let name_tag = format!("{}/{}", vpc_name, p.path);
        let subnet_id = p.id(&vpc_name, "Subnet");
        let rt_id = p.id(&vpc_name, "RouteTable");
        let assoc_id = p.id(&vpc_name, "RouteTableAssociation");
        let route_id = p.id(&vpc_name, "DefaultRoute");

        s.add_resource(
            &subnet_id,
            CfnResource::new(
                "AWS::EC2::Subnet",
                json!({
                    "AvailabilityZone": p.zone,
                    "CidrBlock": p.cidr.to_string(),
                    "MapPublicIpOnLaunch": p.spec.tier == Tier::Public,
                    "Tags": tags(&[
                        ("aws-cdk:subnet-name", p.spec.name.as_str()),
                        ("aws-cdk:subnet-type", p.spec.tier.label()),
                        ("Name", name_tag.as_str()),
                    ]),
                    "VpcId": template::ref_(&vpc_id),
                }),
            ),
        )?;
        s.add_resource(
            &rt_id,
            CfnResource::new(
                "AWS::EC2::RouteTable",
                json!({
                    "Tags": template::name_tag(&name_tag),
                    "VpcId": template::ref_(&vpc_id),
                }),
            ),
        )?;
        s.add_resource(
            &assoc_id,
            CfnResource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": template::ref_(&rt_id),
                    "SubnetId": template::ref_(&subnet_id),
                }),
            ),
        )?;

        match p.spec.tier {
            Tier::Public => {
                s.add_resource(
                    &route_id,
                    CfnResource::new(
                        "AWS::EC2::Route",
                        json!({
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "GatewayId": template::ref_(&igw_id),
                            "RouteTableId": template::ref_(&rt_id),
                        }),
                    )
                    .depends_on(&attach_id),
                )?;
                if Some(&p.spec.name) == nat_segment.as_ref() && p.zone_index < nat_count {
                    let eip_id = p.id(&vpc_name, "EIP");
                    let nat_id = p.id(&vpc_name, "NATGateway");
                    s.add_resource(
                        &eip_id,
                        CfnResource::new(
                            "AWS::EC2::EIP",
                            json!({ "Domain": "vpc", "Tags": template::name_tag(&name_tag) }),
                        ),
                    )?;
                    s.add_resource(
                        &nat_id,
                        CfnResource::new(
                            "AWS::EC2::NatGateway",
                            json!({
                                "AllocationId": template::get_att(&eip_id, "AllocationId"),
                                "SubnetId": template::ref_(&subnet_id),
                                "Tags": template::name_tag(&name_tag),
                            }),
                        )
                        .depends_on(&route_id)
                        .depends_on(&assoc_id),
                    )?;
                }
            }
            Tier::PrivateWithEgress => {
                let nat = &nat_ids[p.zone_index % nat_ids.len()];
                s.add_resource(
                    &route_id,
                    CfnResource::new(
                        "AWS::EC2::Route",
                        json!({
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "NatGatewayId": template::ref_(nat),
                            "RouteTableId": template::ref_(&rt_id),
                        }),
                    ),
                )?;
            }
            Tier::PrivateIsolated => {}
        }

        subnets.push(SubnetHandle {
            segment: p.spec.name.clone(),
            tier: p.spec.tier,
            zone: p.zone.to_string(),
            cidr: p.cidr,
            subnet_id: Reference::to(&stack, &subnet_id),
            route_table_id: Reference::to(&stack, &rt_id),
        });
    }

    let output = config.named("VPCID");
    s.add_output(&output, template::ref_(&vpc_id), Some(&output));

    info!(
        stack = %stack,
        subnets = subnets.len(),
        nat_gateways = nat_count,
        "declared network"
    );

    Ok(NetworkHandle {
        stack,
        name: vpc_name,
        cidr: space,
        vpc_id: vpc,
        zones: net.availability_zones.clone(),
        subnets,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::core::parser;
    use crate::core::types::Environment;
    use proptest::prelude::*;

    const REGIONS: &[&str] = &["ap-southeast-1", "us-east-1", "eu-west-1"];

    proptest! {
        /// Default segments give every zone one public, one egress and one
        /// isolated subnet, in that order.
        #[test]
        fn three_tiers_per_zone(zones in 1usize..=4, region in prop::sample::select(REGIONS)) {
            let names: Vec<String> = ["a", "b", "c", "d"][..zones]
                .iter()
                .map(|s| format!("{}{}", region, s))
                .collect();
            let yaml = format!(
                "version: \"1.0\"\nname: median\nnetwork:\n  availability_zones: [{}]\n",
                names.join(", ")
            );
            let config = parser::parse_config(&yaml).unwrap();
            let mut app = App::new(
                "median",
                Environment {
                    account: None,
                    region: region.to_string(),
                },
            );
            let net = declare(&mut app, &config).unwrap();

            prop_assert_eq!(net.subnets.len(), 3 * zones);
            for zone in &names {
                let tiers: Vec<Tier> = net
                    .subnets
                    .iter()
                    .filter(|s| &s.zone == zone)
                    .map(|s| s.tier)
                    .collect();
                prop_assert_eq!(
                    tiers,
                    vec![Tier::Public, Tier::PrivateWithEgress, Tier::PrivateIsolated]
                );
            }
            let t = &app.stack(&net.stack).unwrap().template;
            prop_assert_eq!(t.resources_of_type("AWS::EC2::Subnet").count(), 3 * zones);
            prop_assert_eq!(t.resources_of_type("AWS::EC2::NatGateway").count(), zones);
        }
    }
}
