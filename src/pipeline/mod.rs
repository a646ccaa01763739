//! Phase sequencing.
//!
//! A compose is a fixed list of phases run strictly in order. Each phase
//! names the checkpoints it commits; when all of them exist the phase is
//! skipped, which is what makes an interrupted run resumable. The first
//! error aborts the run and is returned as-is. Nothing is rolled back:
//! whatever was committed stays for the next attempt.

pub mod observer;
mod phases;

pub use observer::{EventKind, LogObserver, PhaseEvent, PhaseObserver};
pub use phases::{
    BootTestPhase, CmdlinePhase, CombinePhase, DownloadPhase, ExtractPhase, IntegrityPhase,
    SubmitPhase, UkiPhase, UnpackPhase,
};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::checkpoint::manifest::{self, RunManifest};
use crate::checkpoint::{Artifact, CheckpointStore};
use crate::config::ComposeConfig;
use crate::error::Result;
use crate::extract::VirtualDiskBackend;
use crate::remote::{ComposeService, RemoteJobClient};

/// One invocation of the compose pipeline.
#[derive(Debug, Clone)]
pub struct ComposeRun {
    pub workdir: PathBuf,
    pub version: String,
    pub debug: bool,
}

/// Everything a phase may use.
pub struct ComposeContext<'a> {
    pub run: &'a ComposeRun,
    pub config: &'a ComposeConfig,
    pub store: &'a CheckpointStore,
    pub service: &'a dyn ComposeService,
    pub disks: &'a dyn VirtualDiskBackend,
    /// Overrides the configured poll interval.
    pub poll_interval: Option<Duration>,
}

impl ComposeContext<'_> {
    pub fn remote_client(&self) -> RemoteJobClient<'_> {
        let client = RemoteJobClient::new(
            self.service,
            self.store,
            &self.config.service,
            &self.config.tools,
        );
        match self.poll_interval {
            Some(interval) => client.with_poll_interval(interval),
            None => client,
        }
    }
}

/// A named pipeline step.
pub trait Phase {
    fn name(&self) -> &'static str;

    /// Human-readable description for progress output.
    fn label(&self) -> &'static str;

    /// Checkpoints this phase commits. A phase without outputs always runs.
    fn outputs(&self, ctx: &ComposeContext<'_>) -> Vec<Artifact>;

    fn run(&self, ctx: &ComposeContext<'_>) -> Result<()>;
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ran: Vec<&'static str>,
    pub resumed: Vec<&'static str>,
}

pub struct Pipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl Pipeline {
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Self {
        Self { phases }
    }

    /// submit, download, unpack, extract, integrity, combine, cmdline, uki
    /// and, when `boot_test` is set, boot-test.
    pub fn standard(boot_test: bool) -> Self {
        let mut phases: Vec<Box<dyn Phase>> = vec![
            Box::new(SubmitPhase),
            Box::new(DownloadPhase),
            Box::new(UnpackPhase),
            Box::new(ExtractPhase),
            Box::new(IntegrityPhase),
            Box::new(CombinePhase),
            Box::new(CmdlinePhase),
            Box::new(UkiPhase),
        ];
        if boot_test {
            phases.push(Box::new(BootTestPhase));
        }
        Self::new(phases)
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase in order, then record the run manifest.
    pub fn run(
        &self,
        ctx: &ComposeContext<'_>,
        observer: &mut dyn PhaseObserver,
    ) -> Result<RunSummary> {
        let created_at_utc = manifest::utc_now();
        warn_on_settings_drift(ctx);

        let mut summary = RunSummary::default();
        for phase in &self.phases {
            let outputs = phase.outputs(ctx);
            if !outputs.is_empty() && outputs.iter().all(|a| ctx.store.exists(*a)) {
                emit(observer, phase.as_ref(), EventKind::Resumed);
                summary.resumed.push(phase.name());
                continue;
            }

            emit(observer, phase.as_ref(), EventKind::Started);
            let started = Instant::now();
            if let Err(e) = phase.run(ctx) {
                emit(
                    observer,
                    phase.as_ref(),
                    EventKind::Failed {
                        error: e.to_string(),
                    },
                );
                return Err(e);
            }
            emit(
                observer,
                phase.as_ref(),
                EventKind::Finished {
                    elapsed: started.elapsed(),
                },
            );
            summary.ran.push(phase.name());
        }

        let record = RunManifest {
            version: ctx.run.version.clone(),
            debug: ctx.run.debug,
            status: "success".to_string(),
            created_at_utc,
            finished_at_utc: Some(manifest::utc_now()),
            artifacts: manifest::collect_records(ctx.store)?,
        };
        manifest::write_manifest(ctx.store, &record)?;
        info!(
            ran = summary.ran.len(),
            resumed = summary.resumed.len(),
            "compose complete"
        );
        Ok(summary)
    }
}

fn emit(observer: &mut dyn PhaseObserver, phase: &dyn Phase, kind: EventKind) {
    observer.on_event(&PhaseEvent {
        phase: phase.name(),
        label: phase.label(),
        kind,
        at: manifest::utc_now(),
    });
}

/// Committed checkpoints keep the settings they were made with.
fn warn_on_settings_drift(ctx: &ComposeContext<'_>) {
    match manifest::load_manifest(ctx.store.root()) {
        Ok(Some(previous)) => {
            if previous.version != ctx.run.version || previous.debug != ctx.run.debug {
                warn!(
                    previous_version = %previous.version,
                    previous_debug = previous.debug,
                    version = %ctx.run.version,
                    debug = ctx.run.debug,
                    "working directory was composed with different settings; committed artifacts keep them"
                );
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "ignoring unreadable run manifest"),
    }
}
