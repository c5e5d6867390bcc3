//! Front Door (classic and Standard/Premium profiles)
//!
//! A Front Door peer contributes only its instance id; the rule engine folds
//! every id into a single `AzureFrontDoor.Backend` rule with an `x-azure-fdid`
//! header.

use async_trait::async_trait;

use netfence_common::{FenceError, NetworkRestrictionSettings, Result, ResultObject};

use super::{PeerContribution, RestrictionApplier};
use crate::inventory::ResourceMetadata;
use crate::kinds::ResourceKind;

pub struct FrontDoorApplier {
    kind: ResourceKind,
}

impl FrontDoorApplier {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl RestrictionApplier for FrontDoorApplier {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn generate_self_rules(&self, resource: &ResourceMetadata, _max_name_len: usize) -> PeerContribution {
        // classic uses frontdoorId, profiles use frontDoorId
        let id = resource
            .property_str("frontdoorId")
            .or_else(|| resource.property_str("frontDoorId"));
        match id {
            Some(id) => PeerContribution {
                front_door_id: Some(id.to_ascii_lowercase()),
                ..Default::default()
            },
            None => PeerContribution {
                warnings: vec![format!("front door {} exposes no instance id", resource.name)],
                ..Default::default()
            },
        }
    }

    async fn overwrite(&self, _settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        Err(FenceError::unsupported("Overwrite", self.kind.type_name()))
    }

    async fn append(&self, _settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        Err(FenceError::unsupported("Append", self.kind.type_name()))
    }

    async fn check_provisioning_state(&self, _resource_id: &str) -> Result<()> {
        Err(FenceError::unsupported("CheckProvisioningState", self.kind.type_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn front_door(ty: &str, properties: serde_json::Value) -> ResourceMetadata {
        ResourceMetadata {
            id: "/subscriptions/s/resourceGroups/rg/providers/x/y/fd".into(),
            name: "fd".into(),
            resource_type: ty.into(),
            subscription_id: "s".into(),
            resource_group: "rg".into(),
            properties,
        }
    }

    #[test]
    fn test_reads_both_id_spellings() {
        let classic = FrontDoorApplier::new(ResourceKind::FrontDoor).generate_self_rules(
            &front_door("microsoft.network/frontdoors", json!({"frontdoorId": "AAAA-1"})),
            32,
        );
        assert_eq!(classic.front_door_id.as_deref(), Some("aaaa-1"));
        assert!(classic.rules.is_empty());

        let profile = FrontDoorApplier::new(ResourceKind::FrontDoorProfile).generate_self_rules(
            &front_door("microsoft.cdn/profiles", json!({"frontDoorId": "bbbb-2"})),
            32,
        );
        assert_eq!(profile.front_door_id.as_deref(), Some("bbbb-2"));
    }

    #[test]
    fn test_missing_id_warns() {
        let contribution = FrontDoorApplier::new(ResourceKind::FrontDoor)
            .generate_self_rules(&front_door("microsoft.network/frontdoors", json!({})), 32);
        assert!(contribution.front_door_id.is_none());
        assert_eq!(contribution.warnings.len(), 1);
    }
}
