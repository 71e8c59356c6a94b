//! `custom-terraform`: a user-supplied Terraform module.

use serde_json::Value;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::layer::Layer;
use crate::module::relative_source;

fn is_local_source(source: &str) -> bool {
    source.starts_with("./") || source.starts_with("../")
}

pub(super) fn process(layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let layer_dir = layer.dir().to_path_buf();
    let module = &mut layer.modules[index];

    let source = module
        .get_str("source")
        .ok_or_else(|| OptaError::validation(&module.name, "`source` is required"))?
        .to_string();
    let resolved = if is_local_source(&source) {
        let dir = layer_dir.join(&source);
        if !dir.is_dir() {
            return Err(OptaError::validation(
                &module.name,
                format!("local module source {} does not exist", dir.display()),
            ));
        }
        relative_source(&dir, &ctx.config.workdir)
    } else {
        source
    };
    module.module_dir_path = Some(resolved);

    if module.get("version").is_some() {
        module.pass_through("version");
    }

    match module.remove("terraform_inputs") {
        None | Some(Value::Null) => {}
        Some(Value::Object(inputs)) => {
            for (key, value) in inputs {
                module.set(key.clone(), value);
                module.pass_through(key);
            }
        }
        Some(other) => {
            return Err(OptaError::validation(
                &module.name,
                format!("`terraform_inputs` must be a mapping, got {}", other),
            ))
        }
    }
    Ok(())
}
