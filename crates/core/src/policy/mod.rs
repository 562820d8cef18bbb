//! Protection and size-estimation rules for migrations.

use crate::config::MigrationConfig;
use crate::directory::InstanceInfo;
use crate::migration::MigrationError;

const TYPE_TAG: &str = "smartdc_type";
const ROLE_TAG: &str = "smartdc_role";
const NAT_OWNER_KEY: &str = "com.joyent:ipnat_owner";

pub const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Reject instances that must never be migrated: core infrastructure zones,
/// NAT zones, and any role listed in `protected_roles`.
pub fn check_protected(
    instance: &InstanceInfo,
    config: &MigrationConfig,
) -> Result<(), MigrationError> {
    if instance.tags.get(TYPE_TAG).map(String::as_str) == Some("core") {
        return Err(MigrationError::precondition(
            "cannot migrate a core instance",
        ));
    }

    if instance.tags.get(ROLE_TAG).map(String::as_str) == Some("nat")
        || instance.internal_metadata.contains_key(NAT_OWNER_KEY)
    {
        return Err(MigrationError::precondition("cannot migrate a NAT instance"));
    }

    if let Some(role) = instance.tags.get(ROLE_TAG) {
        if config.protected_roles.iter().any(|r| r == role) {
            return Err(MigrationError::precondition(format!(
                "cannot migrate an instance with protected role {}",
                role
            )));
        }
    }

    Ok(())
}

/// Disk footprint in bytes: the sum of the listed disks, or the zone quota
/// when the instance has no disk list.
pub fn disk_footprint(instance: &InstanceInfo) -> u64 {
    if instance.disks.is_empty() {
        instance.quota_gb.unwrap_or(0).saturating_mul(GIB)
    } else {
        instance
            .disks
            .iter()
            .map(|d| d.size_mb.saturating_mul(MIB))
            .fold(0u64, u64::saturating_add)
    }
}

/// Bytes that would be transferred: disk footprint plus memory.
pub fn estimate_size(instance: &InstanceInfo) -> u64 {
    disk_footprint(instance).saturating_add(instance.ram_mb.saturating_mul(MIB))
}
