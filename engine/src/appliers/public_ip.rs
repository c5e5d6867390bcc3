//! Public IP addresses are peers only; they have no firewall of their own

use async_trait::async_trait;

use netfence_common::rule::bounded_name;
use netfence_common::{
    FenceError, IpSecurityRestrictionRule, NetworkRestrictionSettings, PrintOut, Result,
    ResultObject,
};

use super::{PeerContribution, RestrictionApplier};
use crate::inventory::ResourceMetadata;
use crate::kinds::ResourceKind;

pub struct PublicIpApplier;

fn unsupported(operation: &str) -> FenceError {
    FenceError::unsupported(operation, ResourceKind::PublicIpAddress.type_name())
}

#[async_trait]
impl RestrictionApplier for PublicIpApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::PublicIpAddress
    }

    fn generate_self_rules(&self, resource: &ResourceMetadata, max_name_len: usize) -> PeerContribution {
        let mut contribution = PeerContribution::default();
        match resource.property_str("ipAddress") {
            Some(ip) => contribution.rules.push(
                IpSecurityRestrictionRule::for_address(
                    ip,
                    &bounded_name(&resource.name, "", max_name_len),
                )
                .with_description(format!("Public IP {}", resource.name)),
            ),
            None => contribution.warnings.push(format!(
                "public IP {} has no allocated address",
                resource.name
            )),
        }
        contribution
    }

    async fn overwrite(&self, _settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        Err(unsupported("Overwrite"))
    }

    async fn append(&self, _settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        Err(unsupported("Append"))
    }

    fn convert_to_print_out(&self, _settings: &NetworkRestrictionSettings) -> Result<PrintOut> {
        Err(unsupported("ConvertToPrintOut"))
    }

    async fn check_provisioning_state(&self, _resource_id: &str) -> Result<()> {
        Err(unsupported("CheckProvisioningState"))
    }
}
