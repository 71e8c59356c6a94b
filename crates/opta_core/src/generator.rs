//! Render a processed layer into one Terraform JSON document.
//!
//! The document has the top-level keys `terraform` (backend and required
//! providers), `provider`, `data` (the parent's remote state, child layers
//! only), `module` and `output`. Everything is hydrated against the layer's
//! interpolation scope before it is returned, so the result only contains
//! plain Terraform `${...}` references.
//!
//! Alongside the document the generator returns an [`ExecutionPlan`]: the
//! prefixes of the module list that have to be applied on their own because
//! a later module needs something a `halt` module creates (usually the
//! Kubernetes cluster).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs_extra::dir::CopyOptions;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use opta_iac::{module_target, StructuredConfig, UsedDefault, PLAN_FILE};
use opta_registry::Cloud;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::inputs::InjectedValues;
use crate::layer::Layer;
use crate::module::relative_source;
use crate::tags;

/// One module of the declared order, with every address up to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStep {
    pub module_index: usize,
    pub module_name: String,
    /// `module.<name>` for this module and every module declared before it.
    pub targets: Vec<String>,
    pub halt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    pub fn for_layer(layer: &Layer) -> Self {
        let mut targets = Vec::new();
        let steps = layer
            .modules
            .iter()
            .enumerate()
            .map(|(index, module)| {
                targets.push(module_target(&module.name));
                ExecutionStep {
                    module_index: index,
                    module_name: module.name.clone(),
                    targets: targets.clone(),
                    halt: module.spec().halt,
                }
            })
            .collect();
        Self { steps }
    }

    /// Steps that end an apply stage: every halting module, then the last one.
    pub fn stages(&self) -> Vec<&ExecutionStep> {
        let last = self.steps.len().checked_sub(1);
        self.steps
            .iter()
            .filter(|step| step.halt || Some(step.module_index) == last)
            .collect()
    }

    pub fn is_last(&self, step: &ExecutionStep) -> bool {
        self.steps.len().checked_sub(1) == Some(step.module_index)
    }
}

/// The rendered configuration, one map per top-level key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerraformDocument {
    pub terraform: Map<String, Value>,
    pub provider: Map<String, Value>,
    pub data: Map<String, Value>,
    pub module: Map<String, Value>,
    pub output: Map<String, Value>,
}

impl TerraformDocument {
    /// The whole document; empty `data` and `output` sections are left out.
    pub fn to_value(&self) -> Value {
        let mut document = Map::new();
        document.insert("terraform".to_string(), Value::Object(self.terraform.clone()));
        document.insert("provider".to_string(), Value::Object(self.provider.clone()));
        if !self.data.is_empty() {
            document.insert("data".to_string(), Value::Object(self.data.clone()));
        }
        document.insert("module".to_string(), Value::Object(self.module.clone()));
        if !self.output.is_empty() {
            document.insert("output".to_string(), Value::Object(self.output.clone()));
        }
        Value::Object(document)
    }

    /// The document cut into the files `generate-terraform` writes.
    pub fn split_files(&self) -> Vec<(String, Value)> {
        let mut files = vec![
            ("terraform.tf.json".to_string(), json!({ "terraform": self.terraform })),
            ("provider.tf.json".to_string(), json!({ "provider": self.provider })),
        ];
        if !self.data.is_empty() {
            files.push(("data.tf.json".to_string(), json!({ "data": self.data })));
        }
        if !self.output.is_empty() {
            files.push(("output.tf.json".to_string(), json!({ "output": self.output })));
        }
        for (name, block) in &self.module {
            files.push((
                format!("module-{}.tf.json", name),
                json!({ "module": { name.clone(): block } }),
            ));
        }
        files
    }
}

/// Output of [`Generator::generate`].
#[derive(Debug, Clone)]
pub struct Generated {
    pub layer_name: String,
    pub cloud: Cloud,
    pub document: TerraformDocument,
    /// Defaults each module used, keyed by module name.
    pub used_defaults: BTreeMap<String, Vec<UsedDefault>>,
    pub plan: ExecutionPlan,
    /// Packaged module directories the document sources, by module name.
    pub module_dirs: Vec<(String, PathBuf)>,
}

/// Where the rendered layer keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
    /// The cloud's backend from the catalog.
    Remote,
    /// A local state file, for portable output.
    Local(String),
}

pub struct Generator<'a> {
    ctx: &'a Context,
    previous: Option<&'a StructuredConfig>,
    backend: Backend,
}

impl<'a> Generator<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            previous: None,
            backend: Backend::Remote,
        }
    }

    /// Reuse the defaults stored by the last apply.
    pub fn with_previous(mut self, previous: Option<&'a StructuredConfig>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_local_backend(mut self, path: impl Into<String>) -> Self {
        self.backend = Backend::Local(path.into());
        self
    }

    /// Process the layer (once) and render it.
    pub async fn generate(&self, layer: &mut Layer) -> OptaResult<Generated> {
        layer.process_modules(self.ctx).await?;
        let generated = self.render(layer)?;
        for module in &mut layer.modules {
            if let Some(defaults) = generated.used_defaults.get(&module.name) {
                module.used_defaults = defaults.clone();
            }
        }
        Ok(generated)
    }

    /// Render an already processed layer.
    pub fn render(&self, layer: &Layer) -> OptaResult<Generated> {
        if !layer.is_processed() {
            return Err(OptaError::user(format!(
                "Layer {} must be processed before it is rendered",
                layer.name
            )));
        }
        let config = &self.ctx.config;
        let catalog = self.ctx.registry.catalog(layer.cloud)?;
        let scope = layer.scope(config);
        let env_name = layer.root().name.clone();

        let mut modules = Map::new();
        let mut outputs = Map::new();
        let mut used_defaults = BTreeMap::new();
        let mut module_dirs = Vec::new();

        for module in &layer.modules {
            let previous = self
                .previous
                .map(|p| p.defaults_for(&module.name))
                .unwrap_or_default();
            let injected = InjectedValues {
                module_name: module.name.clone(),
                layer_name: layer.name.clone(),
                env_name: env_name.clone(),
            };
            let collides = module
                .spec()
                .exported_outputs()
                .any(|output| outputs.contains_key(&output.name));
            let prefix = collides.then_some(module.name.as_str());

            let rendered = module.render_terraform(prefix, previous, &injected)?;
            debug!(
                "Rendered module {} ({} outputs, {} defaults)",
                rendered.name,
                rendered.outputs.len(),
                rendered.used_defaults.len()
            );
            modules.insert(rendered.name.clone(), rendered.block);
            outputs.extend(rendered.outputs);
            used_defaults.insert(rendered.name, rendered.used_defaults);
            if let Some(dir) = module.module_source_dir(&config.modules_dir) {
                module_dirs.push((module.name.clone(), dir));
            }
        }

        let backend = match &self.backend {
            Backend::Remote => {
                let template = self.ctx.registry.backend(layer.cloud)?;
                json!({ template.kind.clone(): template.config })
            }
            Backend::Local(path) => json!({ "local": { "path": path } }),
        };
        let mut terraform = Map::new();
        terraform.insert(
            "required_providers".to_string(),
            serde_json::to_value(&catalog.required_providers)?,
        );
        terraform.insert("backend".to_string(), backend);

        let provider: Map<String, Value> = catalog
            .providers
            .iter()
            .map(|(name, template)| (name.clone(), template.clone()))
            .collect();

        let mut data = Map::new();
        if let Some(parent) = &layer.parent {
            let template = self.ctx.registry.backend(parent.cloud)?;
            let parent_config = parent.scope(config).hydrate(&template.config)?;
            data.insert(
                "terraform_remote_state".to_string(),
                json!({ "parent": { "backend": template.kind, "config": parent_config } }),
            );
        }

        let hydrate = |map: Map<String, Value>| -> OptaResult<Map<String, Value>> {
            match scope.hydrate(&Value::Object(map))? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            }
        };
        let document = TerraformDocument {
            terraform: hydrate(terraform)?,
            provider: hydrate(provider)?,
            data: hydrate(data)?,
            module: hydrate(modules)?,
            output: hydrate(outputs)?,
        };

        Ok(Generated {
            layer_name: layer.name.clone(),
            cloud: layer.cloud,
            document,
            used_defaults,
            plan: ExecutionPlan::for_layer(layer),
            module_dirs,
        })
    }
}

impl Generated {
    /// Write the document as a single `main.tf.json`.
    pub fn write_main(&self, path: &Path) -> OptaResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.document.to_value())?)?;
        debug!("Wrote {:?}", path);
        Ok(())
    }

    /// Stamp ownership tags on the AWS resources of every packaged module.
    pub fn write_tag_overrides(&self) -> OptaResult<usize> {
        if self.cloud != Cloud::Aws {
            return Ok(0);
        }
        let mut written = 0;
        let mut seen: Vec<&Path> = Vec::new();
        for (_, dir) in &self.module_dirs {
            if seen.contains(&dir.as_path()) {
                continue;
            }
            seen.push(dir);
            if !dir.is_dir() {
                debug!("Skipping tag override for missing module dir {:?}", dir);
                continue;
            }
            if tags::write_tag_override(dir)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write portable Terraform into `out_dir`: the split files, a copy of
    /// every packaged module, and a README with the stepwise apply commands.
    pub fn export(&mut self, ctx: &Context, out_dir: &Path, replace: bool) -> OptaResult<Vec<PathBuf>> {
        prepare_output_dir(out_dir, replace)?;
        let modules_root = out_dir.join("modules");

        let mut copied: Vec<&str> = Vec::new();
        for (name, source_dir) in &self.module_dirs {
            let relative = source_dir
                .strip_prefix(&ctx.config.modules_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(source_dir.file_name().unwrap_or_default()));
            let dest = modules_root.join(&relative);
            if !source_dir.is_dir() {
                warn!("Packaged module {:?} is missing; module {} keeps its source", source_dir, name);
                continue;
            }
            if !dest.exists() {
                let parent = dest.parent().unwrap_or(modules_root.as_path());
                std::fs::create_dir_all(parent)?;
                let mut options = CopyOptions::new();
                options.overwrite = true;
                fs_extra::dir::copy(source_dir, parent, &options)
                    .map_err(|e| OptaError::provider(format!("Copying module {}", name), e))?;
                if self.cloud == Cloud::Aws {
                    tags::write_tag_override(&dest)?;
                }
            }
            if let Some(Value::Object(block)) = self.document.module.get_mut(name) {
                block.insert(
                    "source".to_string(),
                    Value::String(format!("./modules/{}", relative.to_string_lossy().replace('\\', "/"))),
                );
            }
            copied.push(name);
        }

        for (name, block) in self.document.module.iter_mut() {
            if copied.contains(&name.as_str()) {
                continue;
            }
            let Some(Value::String(source)) = block.get_mut("source") else {
                continue;
            };
            if source.starts_with("./") || source.starts_with("../") {
                let absolute = ctx.config.workdir.join(source.as_str());
                *source = relative_source(&absolute, out_dir);
            }
        }

        let mut written = Vec::new();
        for (file, content) in self.document.split_files() {
            let path = out_dir.join(file);
            std::fs::write(&path, serde_json::to_string_pretty(&content)?)?;
            written.push(path);
        }
        let readme = out_dir.join("README.md");
        std::fs::write(&readme, self.readme(&ctx.config.version))?;
        written.push(readme);

        info!("Wrote Terraform for layer {} to {:?}", self.layer_name, out_dir);
        Ok(written)
    }

    fn readme(&self, version: &str) -> String {
        let mut commands = vec!["terraform init".to_string()];
        for step in self.plan.stages() {
            if self.plan.is_last(step) {
                commands.push(format!(
                    "terraform plan -out={plan} && terraform apply {plan}",
                    plan = PLAN_FILE
                ));
            } else {
                let targets: Vec<String> = step.targets.iter().map(|t| format!("-target={}", t)).collect();
                commands.push(format!(
                    "terraform plan {} -out={plan} && terraform apply {plan}",
                    targets.join(" "),
                    plan = PLAN_FILE
                ));
            }
        }

        format!(
            "# Terraform for layer `{layer}`\n\n\
             Generated by opta {version}. State is kept in a local backend.\n\n\
             ## Apply\n\n\
             Modules that create a cluster have to exist before the modules that deploy into it\n\
             can be planned, so apply in this order:\n\n\
             ```sh\n{commands}\n```\n\n\
             ## Destroy\n\n\
             ```sh\nterraform destroy\n```\n",
            layer = self.layer_name,
            version = version,
            commands = commands.join("\n"),
        )
    }
}

/// Refuse a non-empty directory unless `replace`, then clear what a
/// previous export wrote.
fn prepare_output_dir(dir: &Path, replace: bool) -> OptaResult<()> {
    if dir.exists() {
        let non_empty = std::fs::read_dir(dir)?.next().is_some();
        if non_empty && !replace {
            return Err(OptaError::user(format!(
                "{} is not empty; pass --replace to overwrite it",
                dir.display()
            )));
        }
        if non_empty {
            let pattern = dir.join("*.tf.json");
            let generated = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| OptaError::provider("Listing generated files", e))?;
            for path in generated.flatten() {
                std::fs::remove_file(path)?;
            }
            let modules = dir.join("modules");
            if modules.is_dir() {
                std::fs::remove_dir_all(modules)?;
            }
            let readme = dir.join("README.md");
            if readme.exists() {
                std::fs::remove_file(readme)?;
            }
        }
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stages_end_at_halts_and_last_module() {
        let step = |index: usize, halt: bool| ExecutionStep {
            module_index: index,
            module_name: format!("m{}", index),
            targets: (0..=index).map(|i| format!("module.m{}", i)).collect(),
            halt,
        };
        let plan = ExecutionPlan {
            steps: vec![step(0, false), step(1, true), step(2, false), step(3, false)],
        };
        let stages: Vec<usize> = plan.stages().iter().map(|s| s.module_index).collect();
        assert_eq!(stages, vec![1, 3]);
        assert_eq!(plan.stages()[0].targets, vec!["module.m0", "module.m1"]);
        assert!(plan.is_last(plan.stages()[1]));
        assert!(ExecutionPlan::default().stages().is_empty());
    }

    #[test]
    fn test_split_files_skip_empty_sections() {
        let mut document = TerraformDocument::default();
        document.module.insert("db".into(), json!({"source": "./modules/db"}));
        let names: Vec<String> = document.split_files().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["terraform.tf.json", "provider.tf.json", "module-db.tf.json"]);
        assert!(document.to_value().get("output").is_none());
    }

    #[test]
    fn test_output_dir_needs_replace() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("module-old.tf.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        assert!(prepare_output_dir(dir.path(), false).unwrap_err().is_user_error());
        prepare_output_dir(dir.path(), true).unwrap();
        assert!(!dir.path().join("module-old.tf.json").exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
