//! Input validation utilities for naming requests
//!
//! Checks applied before a registration leaves the client.

use validator::ValidationError;

use crate::model::SERVICE_INFO_SPLITER;
use crate::naming::Instance;

/// Maximum length for namespace_id field
pub const MAX_NAMESPACE_ID_LENGTH: usize = 128;

/// Maximum length for group field
pub const MAX_GROUP_LENGTH: usize = 128;

/// Maximum length for service_name field
pub const MAX_SERVICE_NAME_LENGTH: usize = 512;

/// Maximum length for cluster_name field
pub const MAX_CLUSTER_NAME_LENGTH: usize = 64;

/// Upper bound the registry accepts for an instance weight
pub const MAX_WEIGHT: f64 = 10000.0;

/// Validate service_name format
///
/// Service names must be non-empty and must not contain the group separator.
pub fn validate_service_name(service_name: &str) -> Result<(), ValidationError> {
    if service_name.trim().is_empty() {
        return Err(ValidationError::new("service_name_empty"));
    }
    if service_name.len() > MAX_SERVICE_NAME_LENGTH {
        return Err(ValidationError::new("service_name_too_long"));
    }
    if service_name.contains(SERVICE_INFO_SPLITER) {
        return Err(ValidationError::new("service_name_contains_separator"));
    }
    Ok(())
}

/// Validate group format
pub fn validate_group(group: &str) -> Result<(), ValidationError> {
    if group.is_empty() {
        return Err(ValidationError::new("group_empty"));
    }
    if group.len() > MAX_GROUP_LENGTH {
        return Err(ValidationError::new("group_too_long"));
    }
    if !group
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_' || c == ':')
    {
        return Err(ValidationError::new("group_invalid_chars"));
    }
    Ok(())
}

/// Validate namespace_id format (can be empty for default namespace)
pub fn validate_namespace_id(namespace_id: &str) -> Result<(), ValidationError> {
    if namespace_id.len() > MAX_NAMESPACE_ID_LENGTH {
        return Err(ValidationError::new("namespace_id_too_long"));
    }
    if !namespace_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::new("namespace_id_invalid_chars"));
    }
    Ok(())
}

/// Validate cluster name format
pub fn validate_cluster_name(cluster_name: &str) -> Result<(), ValidationError> {
    if cluster_name.is_empty() {
        return Err(ValidationError::new("cluster_name_empty"));
    }
    if cluster_name.len() > MAX_CLUSTER_NAME_LENGTH {
        return Err(ValidationError::new("cluster_name_too_long"));
    }
    if !cluster_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::new("cluster_name_invalid_chars"));
    }
    Ok(())
}

/// Validate IP address format
pub fn validate_ip(ip: &str) -> Result<(), ValidationError> {
    if ip.is_empty() {
        return Err(ValidationError::new("ip_empty"));
    }
    if ip.parse::<std::net::IpAddr>().is_err() {
        return Err(ValidationError::new("ip_invalid"));
    }
    Ok(())
}

/// Validate port number
pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new("port_invalid"));
    }
    Ok(())
}

/// Validate instance weight
pub fn validate_weight(weight: f64) -> Result<(), ValidationError> {
    if !weight.is_finite() || !(0.0..=MAX_WEIGHT).contains(&weight) {
        return Err(ValidationError::new("weight_out_of_range"));
    }
    Ok(())
}

/// Validate everything a registration carries
pub fn validate_instance(service_name: &str, instance: &Instance) -> Result<(), ValidationError> {
    validate_service_name(service_name)?;
    validate_ip(&instance.ip)?;
    validate_port(instance.port)?;
    validate_weight(instance.weight)?;
    validate_cluster_name(&instance.cluster_name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_service_name() {
        assert!(validate_service_name("test").is_ok());
        assert!(validate_service_name("order-service.v1").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("   ").is_err());
        assert!(validate_service_name("DEFAULT_GROUP@@test").is_err());
        assert!(validate_service_name(&"a".repeat(MAX_SERVICE_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_group() {
        assert!(validate_group("DEFAULT_GROUP").is_ok());
        assert!(validate_group("my-group_v1").is_ok());
        assert!(validate_group("").is_err());
        assert!(validate_group("invalid/group").is_err());
    }

    #[test]
    fn test_validate_namespace_id() {
        assert!(validate_namespace_id("").is_ok()); // Empty is valid (default namespace)
        assert!(validate_namespace_id("59bd042678a226516a50e3badb0ac726b91cf393").is_ok());
        assert!(validate_namespace_id("invalid/namespace").is_err());
    }

    #[test]
    fn test_validate_ip() {
        assert!(validate_ip("192.168.1.1").is_ok());
        assert!(validate_ip("::1").is_ok());
        assert!(validate_ip("").is_err());
        assert!(validate_ip("not-an-ip").is_err());
        assert!(validate_ip("256.1.1.1").is_err());
    }

    #[test]
    fn test_validate_port_and_weight() {
        assert!(validate_port(8848).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_weight(1.0).is_ok());
        assert!(validate_weight(0.0).is_ok());
        assert!(validate_weight(-1.0).is_err());
        assert!(validate_weight(f64::NAN).is_err());
        assert!(validate_weight(MAX_WEIGHT + 1.0).is_err());
    }

    #[test]
    fn test_validate_instance() {
        let instance = Instance::new("127.0.0.1", 8848);
        assert!(validate_instance("test", &instance).is_ok());

        let bad = Instance::new("127.0.0.1", 0);
        let err = validate_instance("test", &bad).unwrap_err();
        assert_eq!(err.code, "port_invalid");

        let bad_cluster = Instance::new("127.0.0.1", 80).with_cluster("a/b");
        assert!(validate_instance("test", &bad_cluster).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_ipv4_is_valid(a: u8, b: u8, c: u8, d: u8) {
            let ip = format!("{}.{}.{}.{}", a, b, c, d);
            prop_assert!(validate_ip(&ip).is_ok());
        }

        #[test]
        fn prop_weight_in_range_is_valid(weight in 0.0f64..=MAX_WEIGHT) {
            prop_assert!(validate_weight(weight).is_ok());
        }
    }
}
