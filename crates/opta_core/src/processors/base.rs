//! Network base modules (`aws-base`, `gcp-base`, `azure-base`).

use serde_json::Value;

use crate::error::{OptaError, OptaResult};
use crate::layer::Layer;
use crate::module::Module;

const BYO_VPC_FIELDS: [&str; 3] = ["vpc_id", "public_subnet_ids", "private_subnet_ids"];

pub(super) fn process(layer: &mut Layer, index: usize) -> OptaResult<()> {
    check_byo_vpc(&layer.modules[index])
}

/// Same rules for every cloud's base module.
fn check_byo_vpc(module: &Module) -> OptaResult<()> {
    // Bringing an existing VPC is all or nothing.
    let present: Vec<&str> = BYO_VPC_FIELDS
        .iter()
        .copied()
        .filter(|field| !matches!(module.get(field), None | Some(Value::Null)))
        .collect();
    if !present.is_empty() {
        if let Some(missing) = BYO_VPC_FIELDS.iter().find(|f| !present.contains(f)) {
            return Err(OptaError::validation(
                &module.name,
                format!(
                    "`{}` is required if any of {} are set",
                    missing,
                    BYO_VPC_FIELDS.join(", ")
                ),
            ));
        }
    }

    for field in ["public_subnet_ids", "private_subnet_ids"] {
        let Some(value) = module.get(field) else {
            continue;
        };
        let ids = value.as_array().ok_or_else(|| {
            OptaError::validation(&module.name, format!("`{}` must be a list of subnet ids", field))
        })?;
        let mut seen: Vec<&Value> = Vec::new();
        for id in ids {
            if seen.contains(&id) {
                return Err(OptaError::validation(
                    &module.name,
                    format!("`{}` lists subnet {} more than once", field, id),
                ));
            }
            seen.push(id);
        }
    }
    Ok(())
}
