//! Integration tests for the module catalog.

use opta_registry::{CatalogReader, Cloud, Registry, RegistryError};

#[test]
fn test_registry_rejects_colliding_alias() {
    let content = r#"
cloud: aws
backend: { kind: s3, config: {} }
modules:
  - { name: aws-postgres, aliases: [postgres] }
  - { name: aws-aurora, aliases: [postgres] }
"#;
    let catalog = CatalogReader::parse(Cloud::Aws, content).unwrap();
    let err = Registry::from_catalogs(vec![catalog]).unwrap_err();
    match err {
        RegistryError::InvalidCatalog { cloud, message } => {
            assert_eq!(cloud, "aws");
            assert!(message.contains("alias `postgres`"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_every_cloud_is_catalogued() {
    let registry = Registry::embedded().unwrap();
    let mut clouds = registry.clouds();
    clouds.sort();
    assert_eq!(clouds, Cloud::all());
}

#[test]
fn test_aliases_resolve_per_cloud() {
    let registry = Registry::embedded().unwrap();
    let expected = [
        (Cloud::Aws, "aws-k8s-service"),
        (Cloud::Google, "gcp-k8s-service"),
        (Cloud::Azurerm, "azure-k8s-service"),
    ];
    for (cloud, canonical) in expected {
        let resolved = registry.get_module_type(cloud, "k8s-service").unwrap();
        assert_eq!(resolved.spec.name, canonical);
        assert_eq!(resolved.aliased_type, Some("k8s-service"));
    }

    let direct = registry.get_module_type(Cloud::Aws, "aws-eks").unwrap();
    assert!(direct.aliased_type.is_none());
    assert!(direct.spec.halt);
}

#[test]
fn test_unknown_type_names_the_cloud() {
    let registry = Registry::embedded().unwrap();
    let err = registry.get_module_type(Cloud::Aws, "gcp-gke").unwrap_err();
    match err {
        RegistryError::UnknownModuleType { cloud, module_type } => {
            assert_eq!(cloud, "aws");
            assert_eq!(module_type, "gcp-gke");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_read_dir_loads_only_present_clouds() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("local.yaml"),
        r#"
cloud: local
backend:
  kind: local
  config:
    path: "./tfstate/${{layer_name}}.tfstate"
modules:
  - name: local-base
    module_dir: local_base/tf_module
    inputs:
      - { name: env_name, required: true }
"#,
    )
    .unwrap();

    let registry = Registry::from_dir(dir.path()).unwrap();
    assert_eq!(registry.clouds(), vec![Cloud::Local]);
    assert!(registry.contains(Cloud::Local, "local-base"));
    assert!(registry.catalog(Cloud::Aws).is_err());
}

#[test]
fn test_catalog_for_wrong_cloud_is_rejected() {
    let content = "cloud: google\nbackend: { kind: gcs, config: {} }\nmodules: []\n";
    let err = CatalogReader::parse(Cloud::Aws, content).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidCatalog { .. }));
}
