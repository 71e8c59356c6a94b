//! Apply, destroy and unlock a layer.
//!
//! # Apply
//!
//! The layer is processed and rendered to `main.tf.json`, then applied in
//! stages: every `halt` module closes a stage that is planned and applied
//! with `-target` on its own, and the last stage covers the whole
//! configuration. A halting stage whose modules already exist in the state
//! is skipped. Pre-hooks run before a stage's plan, post-hooks after its
//! apply (with the error, if the apply failed). After the last stage the
//! structured config, including the defaults every module used, is uploaded.
//!
//! # Destroy
//!
//! Refused while any other layer in the state storage names this one as its
//! parent. Modules are destroyed one at a time in reverse declared order,
//! each followed by its post-delete hook; the first failure stops the run
//! and leaves the remaining modules in place.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use opta_iac::{module_target, ApplyOptions, CloudClient, PlanOptions, TerraformRunner, PLAN_FILE};

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::generator::Generator;
use crate::kube::{Helm, KubeTarget};
use crate::layer::Layer;
use crate::lockfile::ProcessLock;
use crate::processors::ProcessorKind;

/// Flags shared by `apply` and `destroy`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip the confirmation prompt.
    pub auto_approve: bool,
    /// Print the full `terraform show` output next to the summary.
    pub detailed_plan: bool,
}

impl RunOptions {
    pub fn auto_approve(mut self) -> Self {
        self.auto_approve = true;
        self
    }

    pub fn detailed_plan(mut self, detailed: bool) -> Self {
        self.detailed_plan = detailed;
        self
    }
}

/// How a lifecycle command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The user declined a confirmation.
    Cancelled,
}

fn needs_kubeconfig(layer: &Layer) -> bool {
    layer.modules.iter().any(|module| {
        matches!(
            ProcessorKind::for_type(&module.module_type),
            ProcessorKind::K8sBase | ProcessorKind::K8sService | ProcessorKind::HelmChart | ProcessorKind::Datadog
        )
    })
}

fn remove_if_present(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {:?}: {}", path, e),
    }
}

pub struct Lifecycle<'a> {
    ctx: &'a Context,
}

impl<'a> Lifecycle<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn client(&self, layer: &Layer) -> Box<dyn CloudClient> {
        self.ctx.cloud_client(layer.state_location(&self.ctx.config))
    }

    fn lock(&self) -> OptaResult<ProcessLock> {
        ProcessLock::acquire(&self.ctx.config.opta_home, &self.ctx.config.workdir)
    }

    /// Remove the transient files terraform runs leave in the workdir.
    fn cleanup(&self) {
        let workdir = &self.ctx.config.workdir;
        remove_if_present(&self.ctx.config.main_tf_path());
        remove_if_present(&workdir.join(PLAN_FILE));
        remove_if_present(&workdir.join(".terraform"));
    }

    async fn ensure_unlocked(&self, layer: &Layer, client: &dyn CloudClient) -> OptaResult<()> {
        if let Some(lock_id) = client.get_terraform_lock_id().await? {
            return Err(OptaError::StateLocked {
                layer: layer.name.clone(),
                lock_id,
            });
        }
        Ok(())
    }

    async fn ensure_parent_applied(&self, layer: &Layer) -> OptaResult<()> {
        let Some(parent) = &layer.parent else {
            return Ok(());
        };
        let parent_client = self.client(parent);
        if parent_client.get_remote_config().await?.is_none() {
            return Err(OptaError::user(format!(
                "Layer {} has not been applied yet; apply it before {}",
                parent.name, layer.name
            )));
        }
        Ok(())
    }

    async fn ensure_no_children(&self, layer: &Layer, client: &dyn CloudClient) -> OptaResult<()> {
        let children: Vec<String> = client
            .list_remote_configs()
            .await?
            .into_iter()
            .filter(|entry| entry.layer_name != layer.name && entry.config.depends_on(&layer.name))
            .map(|entry| entry.layer_name)
            .collect();
        if !children.is_empty() {
            return Err(OptaError::user(format!(
                "Found the following services that depend on this environment. Please run `opta destroy` on them first!\n{}",
                children.join("\n")
            )));
        }
        Ok(())
    }

    /// Point the layer at its cluster's kubeconfig once the cluster exists.
    async fn refresh_kube(&self, layer: &mut Layer, client: &dyn CloudClient) -> OptaResult<()> {
        if layer.kube.is_some() || !needs_kubeconfig(layer) {
            return Ok(());
        }
        if !client.cluster_exist().await? {
            debug!("No cluster for layer {} yet", layer.name);
            return Ok(());
        }
        let kubeconfig = client.set_kube_config().await?;
        layer.kube = Some(KubeTarget {
            kubeconfig,
            context: client.get_kube_context_name(),
        });
        Ok(())
    }

    /// Show the saved plan and ask for approval. `None` when it changes nothing.
    async fn confirm_plan(
        &self,
        tf: &TerraformRunner,
        options: &RunOptions,
        question: &str,
    ) -> OptaResult<Option<bool>> {
        let summary = tf.show_summary(PLAN_FILE).await?;
        self.ctx.interaction.show(&summary.render());
        if options.detailed_plan {
            self.ctx.interaction.show(&tf.show(PLAN_FILE).await?);
        }
        if summary.is_empty() {
            return Ok(None);
        }
        if options.auto_approve {
            return Ok(Some(true));
        }
        Ok(Some(self.ctx.interaction.confirm(question, false)?))
    }

    pub async fn apply(&self, layer: &mut Layer, options: &RunOptions) -> OptaResult<Outcome> {
        let _lock = self.lock()?;
        let applying = self.ctx.applying();
        let ctx = &applying;
        let client = self.client(layer);

        self.ensure_parent_applied(layer).await?;
        self.ensure_unlocked(layer, client.as_ref()).await?;
        let previous = client.get_remote_config().await?;
        self.refresh_kube(layer, client.as_ref()).await?;

        let generated = Generator::new(ctx)
            .with_previous(previous.as_ref())
            .generate(layer)
            .await?;
        generated.write_main(&ctx.config.main_tf_path())?;
        generated.write_tag_overrides()?;

        let tf = ctx.terraform(&layer.name).streaming();
        tf.init(false).await?;
        let existing = tf.get_existing_modules().await?;

        let mut next_hook = 0;
        for stage in generated.plan.stages() {
            let is_last = generated.plan.is_last(stage);
            let has_new_modules = layer.modules[..=stage.module_index]
                .iter()
                .any(|module| !existing.contains(&module.name));
            if !is_last && !has_new_modules {
                debug!("Modules up to {} already exist, skipping their stage", stage.module_name);
                continue;
            }
            info!("Applying layer {} up to module {}", layer.name, stage.module_name);

            for index in next_hook..=stage.module_index {
                layer.pre_hook(index, ctx).await?;
            }

            let targets = if is_last { Vec::new() } else { stage.targets.clone() };
            tf.plan(&PlanOptions::default().targets(targets).out(PLAN_FILE)).await?;
            match self.confirm_plan(&tf, options, "Apply these changes?").await? {
                None => info!("No changes for this stage"),
                Some(false) => {
                    info!("Apply of layer {} cancelled", layer.name);
                    self.cleanup();
                    return Ok(Outcome::Cancelled);
                }
                Some(true) => {
                    let applied = tf
                        .apply(&ApplyOptions {
                            plan_file: Some(PLAN_FILE.to_string()),
                            ..Default::default()
                        })
                        .await;
                    if let Err(e) = applied {
                        let e = OptaError::from(e);
                        for index in next_hook..=stage.module_index {
                            if let Err(hook_error) = layer.post_hook(index, ctx, Some(&e)).await {
                                warn!("Post hook of {} failed: {}", layer.modules[index].name, hook_error);
                            }
                        }
                        return Err(e);
                    }
                }
            }

            for index in next_hook..=stage.module_index {
                layer.post_hook(index, ctx, None).await?;
            }
            next_hook = stage.module_index + 1;
            if !is_last {
                self.refresh_kube(layer, client.as_ref()).await?;
            }
        }

        let structured = layer.structured_config(&ctx.config, generated.used_defaults.clone());
        client.upload_opta_config(&structured).await?;
        self.cleanup();
        info!("Layer {} applied", layer.name);
        Ok(Outcome::Completed)
    }

    pub async fn destroy(&self, layer: &mut Layer, options: &RunOptions) -> OptaResult<Outcome> {
        let _lock = self.lock()?;
        let ctx = self.ctx;
        let client = self.client(layer);

        self.ensure_no_children(layer, client.as_ref()).await?;
        self.ensure_unlocked(layer, client.as_ref()).await?;
        let previous = client.get_remote_config().await?;
        self.refresh_kube(layer, client.as_ref()).await?;

        let generated = Generator::new(ctx)
            .with_previous(previous.as_ref())
            .generate(layer)
            .await?;
        generated.write_main(&ctx.config.main_tf_path())?;
        generated.write_tag_overrides()?;

        let tf = ctx.terraform(&layer.name).streaming();
        tf.init(false).await?;
        let existing = tf.get_existing_modules().await?;
        let order: Vec<usize> = (0..layer.modules.len())
            .rev()
            .filter(|index| existing.contains(&layer.modules[*index].name))
            .collect();

        if order.is_empty() {
            info!("Layer {} has no deployed modules", layer.name);
        } else {
            tf.plan(&PlanOptions::default().destroy().out(PLAN_FILE)).await?;
            let question = format!("Destroy layer {}? This cannot be undone.", layer.name);
            if self.confirm_plan(&tf, options, &question).await? == Some(false) {
                info!("Destroy of layer {} cancelled", layer.name);
                self.cleanup();
                return Ok(Outcome::Cancelled);
            }
            for index in order {
                let name = layer.modules[index].name.clone();
                info!("Destroying module {}", name);
                tf.destroy(&[module_target(&name)], true).await?;
                layer.post_delete(index, ctx).await?;
            }
        }

        client.delete_opta_config().await?;
        client.delete_remote_state().await?;
        if layer.is_root() && layer.cloud.has_remote_bucket() {
            client.delete_state_storage().await?;
        }
        self.cleanup();
        info!("Layer {} destroyed", layer.name);
        Ok(Outcome::Completed)
    }

    pub async fn force_unlock(&self, layer: &mut Layer) -> OptaResult<Outcome> {
        let ctx = self.ctx;
        let first = format!(
            "This removes the Terraform lock on layer {}. Only continue if no other opta or terraform run is active. Continue?",
            layer.name
        );
        if !ctx.interaction.confirm(&first, false)? {
            return Ok(Outcome::Cancelled);
        }
        if !ctx
            .interaction
            .confirm("Removing a lock held by a running apply can corrupt the state. Are you sure?", false)?
        {
            return Ok(Outcome::Cancelled);
        }

        let _lock = self.lock()?;
        let client = self.client(layer);
        match client.get_terraform_lock_id().await? {
            Some(lock_id) => {
                let generated = Generator::new(ctx).generate(layer).await?;
                generated.write_main(&ctx.config.main_tf_path())?;
                let tf = ctx.terraform(&layer.name);
                let unlocked = match tf.init(false).await {
                    Ok(()) => tf.force_unlock(&lock_id).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = unlocked {
                    warn!("terraform force-unlock failed ({}), deleting the lock directly", e);
                    client.force_delete_terraform_lock().await?;
                }
                info!("Removed lock {} from layer {}", lock_id, layer.name);
            }
            None => info!("Layer {} is not locked", layer.name),
        }

        self.rollback_pending_releases(layer, client.as_ref()).await?;
        self.cleanup();
        Ok(Outcome::Completed)
    }

    /// Offer to roll back helm releases an interrupted apply left in
    /// `pending-upgrade`.
    async fn rollback_pending_releases(&self, layer: &mut Layer, client: &dyn CloudClient) -> OptaResult<()> {
        self.refresh_kube(layer, client).await?;
        let Some(target) = layer.kube.clone() else {
            return Ok(());
        };
        let helm = Helm::new(self.ctx.runner.as_ref(), &target);
        for release in helm.pending_releases(&layer.name).await? {
            if release.status != "pending-upgrade" {
                continue;
            }
            let question = format!(
                "Helm release {} is stuck in pending-upgrade. Roll it back to its previous revision?",
                release.name
            );
            if !self.ctx.interaction.confirm(&question, true)? {
                continue;
            }
            helm.rollback(&release).await?;
            info!("Rolled back helm release {}", release.name);
        }
        Ok(())
    }

    /// Write portable Terraform for the layer into `out_dir`.
    pub async fn generate_terraform(&self, layer: &mut Layer, out_dir: &Path, replace: bool) -> OptaResult<Vec<PathBuf>> {
        let state_path = format!("./tfstate/{}.tfstate", layer.name);
        let mut generated = Generator::new(self.ctx)
            .with_local_backend(state_path)
            .generate(layer)
            .await?;
        generated.export(self.ctx, out_dir, replace)
    }
}
