//! Databases and caches that sit inside the environment's network.

use crate::error::{OptaError, OptaResult};
use crate::layer::Layer;

use super::layer_or_parent_ref;

fn network_inputs(module_type: &str) -> Option<(&'static str, &'static [&'static str])> {
    match module_type {
        "aws-postgres" | "aws-mysql" | "aws-redis" | "aws-documentdb" => Some((
            "aws-base",
            &["kms_account_key_arn", "vpc_id", "private_subnet_ids"],
        )),
        "gcp-postgres" | "gcp-redis" => Some(("gcp-base", &["vpc_self_link"])),
        "azure-postgres" | "azure-redis" => Some(("azure-base", &["private_subnet_id"])),
        _ => None,
    }
}

pub(super) fn process(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let module_type = layer.modules[index].module_type.clone();
    let Some((base_type, inputs)) = network_inputs(&module_type) else {
        return Ok(());
    };

    let mut wiring = Vec::new();
    for input in inputs {
        if layer.modules[index].get(input).is_some() {
            continue;
        }
        let value = layer_or_parent_ref(layer, index, &[base_type], input).ok_or_else(|| {
            OptaError::validation(
                &layer.modules[index].name,
                format!("needs a {} module in this layer or its environment", base_type),
            )
        })?;
        wiring.push((*input, value));
    }

    let module = &mut layer.modules[index];
    for (input, value) in wiring {
        module.set(input, value);
    }
    Ok(())
}
