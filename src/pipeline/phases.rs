use tracing::info;

use super::{ComposeContext, Phase};
use crate::assemble::{
    build_boot_executable, combine_volumes, write_command_line, write_os_release,
};
use crate::blueprint::{load_blueprint, TemplateVars};
use crate::boottest;
use crate::checkpoint::Artifact;
use crate::error::Result;
use crate::extract::{extract_boot_artifacts, ExtractOptions};
use crate::integrity::{build_integrity_table, load_integrity_table};
use crate::source::{refresh_source, source_dir};

/// Refresh sources, push the blueprint, queue the compose.
pub struct SubmitPhase;

impl Phase for SubmitPhase {
    fn name(&self) -> &'static str {
        "submit"
    }

    fn label(&self) -> &'static str {
        "Submitting compose"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::ComposeId]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        let commit = match &ctx.config.source.url {
            Some(url) => Some(refresh_source(
                &ctx.config.tools.git,
                url,
                &ctx.config.source.branch,
                &source_dir(&ctx.run.workdir),
            )?),
            None => None,
        };
        let vars = TemplateVars {
            version: &ctx.run.version,
            commit: commit.as_deref(),
            debug: ctx.run.debug,
        };
        let blueprint = load_blueprint(&ctx.config.blueprint.template, &vars)?;
        ctx.remote_client().submit(&blueprint)?;
        Ok(())
    }
}

/// Wait for the compose and download its results.
pub struct DownloadPhase;

impl Phase for DownloadPhase {
    fn name(&self) -> &'static str {
        "download"
    }

    fn label(&self) -> &'static str {
        "Waiting for compose results"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::ResultBundle]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        let client = ctx.remote_client();
        let job_id = client.job_id()?;
        client.await_terminal(&job_id)?;
        client.fetch_results(&job_id)
    }
}

pub struct UnpackPhase;

impl Phase for UnpackPhase {
    fn name(&self) -> &'static str {
        "unpack"
    }

    fn label(&self) -> &'static str {
        "Unpacking disk image"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::RawImage]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        let client = ctx.remote_client();
        let job_id = client.job_id()?;
        client.unpack_results(&job_id)
    }
}

pub struct ExtractPhase;

impl ExtractPhase {
    fn options(ctx: &ComposeContext<'_>) -> ExtractOptions {
        ExtractOptions {
            require_symbol_map: ctx.config.kernel.require_symbol_map,
        }
    }
}

impl Phase for ExtractPhase {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn label(&self) -> &'static str {
        "Extracting boot files and root volume"
    }

    fn outputs(&self, ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        Self::options(ctx).outputs()
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        extract_boot_artifacts(ctx.store, ctx.disks, Self::options(ctx))
    }
}

pub struct IntegrityPhase;

impl Phase for IntegrityPhase {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn label(&self) -> &'static str {
        "Building dm-verity hash tree"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::HashVolume, Artifact::VerityUuid, Artifact::RootHash]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        build_integrity_table(ctx.store, &ctx.config.tools)?;
        Ok(())
    }
}

pub struct CombinePhase;

impl Phase for CombinePhase {
    fn name(&self) -> &'static str {
        "combine"
    }

    fn label(&self) -> &'static str {
        "Combining root and hash volumes"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::CombinedVolume]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        combine_volumes(
            ctx.store,
            ctx.config.volume.compression,
            &ctx.config.tools.xz,
        )
    }
}

pub struct CmdlinePhase;

impl Phase for CmdlinePhase {
    fn name(&self) -> &'static str {
        "cmdline"
    }

    fn label(&self) -> &'static str {
        "Writing kernel command line"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::CommandLine]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        let table = load_integrity_table(ctx.store)?;
        let line = write_command_line(ctx.store, &table, ctx.run.debug)?;
        info!(cmdline = %line, "kernel command line");
        Ok(())
    }
}

pub struct UkiPhase;

impl Phase for UkiPhase {
    fn name(&self) -> &'static str {
        "uki"
    }

    fn label(&self) -> &'static str {
        "Building unified kernel image"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        vec![Artifact::OsRelease, Artifact::BootExecutable]
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        write_os_release(ctx.store, &ctx.config.boot.os_release, &ctx.run.version)?;
        build_boot_executable(ctx.store, &ctx.config.boot.stub, &ctx.config.tools.objcopy)
    }
}

/// Boot the result in QEMU. Has no outputs, so it runs every time.
pub struct BootTestPhase;

impl Phase for BootTestPhase {
    fn name(&self) -> &'static str {
        "boot-test"
    }

    fn label(&self) -> &'static str {
        "Boot-testing in QEMU"
    }

    fn outputs(&self, _ctx: &ComposeContext<'_>) -> Vec<Artifact> {
        Vec::new()
    }

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()> {
        boottest::run_boot_test(ctx.store, &ctx.config.test)
    }
}
