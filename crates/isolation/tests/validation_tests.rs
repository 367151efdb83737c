//! Identifier validation integration tests.
//!
//! Run with: `cargo test -p tenantry-isolation --test validation_tests`

mod common;

use tenantry_isolation::TenancyConfig;
use tenantry_isolation::dialect::table_name_prefix;
use tenantry_isolation::error::IdentifierError;
use tenantry_isolation::validation::{
    MAX_IDENTIFIER_BYTES, assert_safe_database_name, assert_safe_schema_name,
    assert_safe_table_name, assert_safe_tenant_identifier, sanitize_identifier,
    validate_database_name, validate_schema_name, validate_tenant_identifier,
};

use common::hostile_identifiers;

// ============================================================================
// Acceptance
// ============================================================================

#[test]
fn test_well_formed_identifiers_are_accepted() {
    let longest = "a".repeat(63);
    for identifier in ["acme", "acme-corp", "a1b", "tenant-42-eu", longest.as_str()] {
        assert!(validate_tenant_identifier(identifier), "{identifier}");
        assert!(assert_safe_tenant_identifier(identifier, "test").is_ok());
    }
    let longest = "s".repeat(63);
    for name in ["_private", "tenant_acme", "t", longest.as_str()] {
        assert!(validate_schema_name(name), "{name}");
        assert!(validate_database_name(name), "{name}");
    }
}

#[test]
fn test_hostile_identifiers_are_rejected() {
    for identifier in hostile_identifiers() {
        assert!(
            !validate_tenant_identifier(&identifier),
            "accepted {identifier:?}"
        );
        let err = assert_safe_tenant_identifier(&identifier, "provision tenant").unwrap_err();
        assert!(matches!(err, IdentifierError::InvalidTenantIdentifier { .. }));
    }
}

#[test]
fn test_hostile_names_are_rejected_at_every_boundary() {
    let overlong = "s".repeat(64);
    for name in [
        "tenant; DROP TABLE x",
        "Tenant",
        "1tenant",
        "tenant-acme",
        "tenant\"acme",
        "",
        overlong.as_str(),
    ] {
        assert!(!validate_schema_name(name), "{name:?}");
        assert!(matches!(
            assert_safe_schema_name(name, "create schema").unwrap_err(),
            IdentifierError::InvalidSchemaName { .. }
        ));
        assert!(matches!(
            assert_safe_database_name(name, "create database").unwrap_err(),
            IdentifierError::InvalidDatabaseName { .. }
        ));
        assert!(matches!(
            assert_safe_table_name(name, "drop table").unwrap_err(),
            IdentifierError::InvalidTableName { .. }
        ));
    }
}

#[test]
fn test_rejection_carries_value_and_context() {
    let err = assert_safe_schema_name("x; --", "initialize tenant t-1").unwrap_err();
    assert_eq!(err.value(), "x; --");
    let message = err.to_string();
    assert!(message.contains("x; --"));
    assert!(message.contains("initialize tenant t-1"));

    let huge = "a".repeat(10_000);
    let err = assert_safe_tenant_identifier(&huge, "resolve").unwrap_err();
    assert!(err.to_string().len() < 200);
}

// ============================================================================
// Sanitizing
// ============================================================================

#[test]
fn test_sanitize_always_yields_a_valid_name() {
    let mut inputs = hostile_identifiers();
    inputs.extend(["Acme-Corp!", "42", "__", "my.company", "ÅNGSTRÖM"].map(String::from));
    for input in inputs {
        let out = sanitize_identifier(&input);
        assert!(validate_schema_name(&out), "{input:?} -> {out:?}");
        assert!(out.len() <= MAX_IDENTIFIER_BYTES);
        assert_eq!(sanitize_identifier(&out), out, "not idempotent for {input:?}");
    }
}

#[test]
fn test_sanitize_examples() {
    assert_eq!(sanitize_identifier("Acme-Corp!"), "acme_corp");
    assert_eq!(sanitize_identifier("42"), "t_42");
    assert_eq!(sanitize_identifier(""), "tenant");
    assert_eq!(sanitize_identifier("a--b__c"), "a_b_c");
}

// ============================================================================
// Derived names
// ============================================================================

#[test]
fn test_derived_names_pass_validation() {
    let config = TenancyConfig::new("sqlite://:memory:");
    let longest = "x".repeat(63);
    for identifier in ["acme", "acme-corp", longest.as_str()] {
        assert!(validate_database_name(&config.database_name_for(identifier)));
        let prefix = table_name_prefix(identifier);
        assert!(validate_schema_name(&prefix), "{prefix}");
        assert!(prefix.len() <= 23);
    }
    assert_eq!(config.database_name_for("acme-corp"), "tenant_acme_corp_db");
    assert!(validate_schema_name(&config.schema_name_for("acme-corp")));

    // Schema names are not shortened; providers reject the overflow.
    assert!(!validate_schema_name(&config.schema_name_for(&longest)));
}

#[test]
fn test_long_prefixes_stay_distinct() {
    let a = table_name_prefix(&format!("{}-one", "x".repeat(40)));
    let b = table_name_prefix(&format!("{}-two", "x".repeat(40)));
    assert_ne!(a, b);
    assert_ne!(table_name_prefix("t-acme"), table_name_prefix("acme"));
    assert!(!table_name_prefix("acme-corp").starts_with(&table_name_prefix("acme")));
}
