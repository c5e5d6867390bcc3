//! Closed set of resource kinds keyed by their resource-type string

use netfence_common::{resource_id, FenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    WebSite,
    WebSiteSlot,
    PublicIpAddress,
    FrontDoor,
    FrontDoorProfile,
    CosmosDb,
    Storage,
    KeyVault,
    SqlServer,
    Subnet,
}

const KINDS: &[(&str, ResourceKind)] = &[
    ("microsoft.web/sites", ResourceKind::WebSite),
    ("microsoft.web/sites/slots", ResourceKind::WebSiteSlot),
    ("microsoft.network/publicipaddresses", ResourceKind::PublicIpAddress),
    ("microsoft.network/frontdoors", ResourceKind::FrontDoor),
    ("microsoft.cdn/profiles", ResourceKind::FrontDoorProfile),
    ("microsoft.documentdb/databaseaccounts", ResourceKind::CosmosDb),
    ("microsoft.storage/storageaccounts", ResourceKind::Storage),
    ("microsoft.keyvault/vaults", ResourceKind::KeyVault),
    ("microsoft.sql/servers", ResourceKind::SqlServer),
    ("microsoft.network/virtualnetworks/subnets", ResourceKind::Subnet),
];

impl ResourceKind {
    pub fn from_type(resource_type: &str) -> Option<Self> {
        let wanted = resource_type.trim();
        KINDS
            .iter()
            .find(|(ty, _)| ty.eq_ignore_ascii_case(wanted))
            .map(|(_, kind)| *kind)
    }

    pub fn from_resource_id(id: &str) -> Result<Self> {
        let ty = resource_id::resource_type(id)?;
        Self::from_type(&ty)
            .ok_or_else(|| FenceError::validation(format!("unsupported resource type {ty} in {id}")))
    }

    pub fn type_name(&self) -> &'static str {
        KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(ty, _)| *ty)
            .unwrap_or("unknown")
    }

    /// Management API version used for reads and writes of this kind
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::WebSite | Self::WebSiteSlot => "2022-03-01",
            Self::PublicIpAddress => "2023-09-01",
            Self::FrontDoor => "2021-06-01",
            Self::FrontDoorProfile => "2023-05-01",
            Self::CosmosDb => "2023-04-15",
            Self::Storage => "2023-01-01",
            Self::KeyVault => "2023-07-01",
            Self::SqlServer => "2021-11-01",
            Self::Subnet => "2023-09-01",
        }
    }

    pub fn is_web_site(&self) -> bool {
        matches!(self, Self::WebSite | Self::WebSiteSlot)
    }

    pub fn is_front_door(&self) -> bool {
        matches!(self, Self::FrontDoor | Self::FrontDoorProfile)
    }

    /// Only web sites carry a separate SCM (deployment endpoint) rule list
    pub fn has_scm(&self) -> bool {
        self.is_web_site()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_resource_id() {
        let site = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Web/sites/app1";
        assert_eq!(ResourceKind::from_resource_id(site).unwrap(), ResourceKind::WebSite);

        let slot = format!("{site}/slots/staging");
        assert_eq!(
            ResourceKind::from_resource_id(&slot).unwrap(),
            ResourceKind::WebSiteSlot
        );

        let subnet = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/a";
        assert_eq!(ResourceKind::from_resource_id(subnet).unwrap(), ResourceKind::Subnet);

        let vm = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm";
        assert!(ResourceKind::from_resource_id(vm).is_err());
    }

    #[test]
    fn test_type_name_round_trips() {
        for (ty, kind) in KINDS {
            assert_eq!(kind.type_name(), *ty);
            assert_eq!(ResourceKind::from_type(&ty.to_uppercase()), Some(*kind));
        }
    }

    #[test]
    fn test_scm_only_for_web_sites() {
        assert!(ResourceKind::WebSite.has_scm());
        assert!(ResourceKind::WebSiteSlot.has_scm());
        assert!(!ResourceKind::Storage.has_scm());
        assert!(ResourceKind::FrontDoorProfile.is_front_door());
    }
}
