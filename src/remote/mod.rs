//! Remote compose jobs.
//!
//! A compose is submitted once and its id persisted immediately as the
//! `compose-id` checkpoint; every later step, including a restarted run,
//! works from that id. The service is only ever polled, never cancelled.
//!
//! ```text
//! queued ──► running ──► finished
//!    │          │
//!    └──────────┴──────► failed
//! ```

mod weldr;

pub use weldr::WeldrClient;

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::blueprint::Blueprint;
use crate::checkpoint::{Artifact, CheckpointStore};
use crate::codec::{self, Compression};
use crate::config::{ServiceConfig, ToolsConfig};
use crate::error::{ComposeError, IoContext, Result};

/// Normalized job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    /// A label we do not know; treated as a terminal failure.
    Unknown(String),
}

impl JobStatus {
    /// Map a service status label (case-insensitive).
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        match label.to_ascii_lowercase().as_str() {
            "waiting" | "pending" | "queued" => JobStatus::Queued,
            "running" | "building" => JobStatus::Running,
            "finished" | "success" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Unknown(label.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => f.write_str("queued"),
            JobStatus::Running => f.write_str("running"),
            JobStatus::Finished => f.write_str("finished"),
            JobStatus::Failed => f.write_str("failed"),
            JobStatus::Unknown(label) => write!(f, "unrecognized status '{label}'"),
        }
    }
}

/// Body of a compose request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub blueprint_name: String,
    pub compose_type: String,
    pub branch: String,
}

/// Transport to the compose service.
pub trait ComposeService {
    /// Create or replace a blueprint from its TOML text.
    fn push_blueprint(&self, toml: &str) -> Result<()>;

    /// Queue a compose and return its id.
    fn submit(&self, request: &BuildRequest) -> Result<String>;

    /// Raw status label of a compose.
    fn queue_status(&self, job_id: &str) -> Result<String>;

    /// Stream the result archive of a finished compose into `out`.
    fn download_results(&self, job_id: &str, out: &mut dyn Write) -> Result<u64>;
}

/// Compose job bookkeeping on top of a [`ComposeService`].
pub struct RemoteJobClient<'a> {
    service: &'a dyn ComposeService,
    store: &'a CheckpointStore,
    settings: &'a ServiceConfig,
    xz_tool: &'a str,
    poll_interval: Duration,
}

impl<'a> RemoteJobClient<'a> {
    pub fn new(
        service: &'a dyn ComposeService,
        store: &'a CheckpointStore,
        settings: &'a ServiceConfig,
        tools: &'a ToolsConfig,
    ) -> Self {
        Self {
            service,
            store,
            settings,
            xz_tool: &tools.xz,
            poll_interval: settings.poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Push `blueprint`, queue a compose of it and persist the job id.
    ///
    /// Returns the persisted id instead when one exists.
    pub fn submit(&self, blueprint: &Blueprint) -> Result<String> {
        if self.store.exists(Artifact::ComposeId) {
            let job_id = self.job_id()?;
            info!(job_id = %job_id, "resuming existing compose");
            return Ok(job_id);
        }

        self.service.push_blueprint(&blueprint.text)?;
        let request = BuildRequest {
            blueprint_name: blueprint.name.clone(),
            compose_type: self.settings.compose_type.clone(),
            branch: self.settings.branch.clone(),
        };
        let job_id = self.service.submit(&request)?;
        check_job_id(&job_id, "compose service")?;
        self.store
            .write_string(Artifact::ComposeId, &format!("{job_id}\n"))?;
        info!(job_id = %job_id, blueprint = %blueprint.name, "compose submitted");
        Ok(job_id)
    }

    /// The persisted job id.
    pub fn job_id(&self) -> Result<String> {
        let job_id = self.store.read_to_string(Artifact::ComposeId)?;
        check_job_id(&job_id, "checkpoint 'compose-id'")?;
        Ok(job_id)
    }

    /// Poll until the job reaches a terminal state.
    pub fn await_terminal(&self, job_id: &str) -> Result<()> {
        let mut last = None;
        loop {
            let label = self.service.queue_status(job_id)?;
            let status = JobStatus::from_label(&label);
            if last.as_ref() != Some(&status) {
                info!(job_id, status = %status, "compose status");
            } else {
                debug!(job_id, status = %status, "compose status unchanged");
            }
            match status {
                JobStatus::Finished => return Ok(()),
                // The service's own label, so the error names what it reported.
                JobStatus::Failed | JobStatus::Unknown(_) => {
                    return Err(ComposeError::RemoteJob {
                        job_id: job_id.to_string(),
                        status: label.trim().to_string(),
                    })
                }
                JobStatus::Queued | JobStatus::Running => {}
            }
            last = Some(status);
            thread::sleep(self.poll_interval);
        }
    }

    /// Stream the result bundle into the `results.tar` checkpoint.
    pub fn fetch_results(&self, job_id: &str) -> Result<()> {
        if self.store.exists(Artifact::ResultBundle) {
            return Ok(());
        }
        info!(job_id, "downloading compose results");
        let mut size = 0;
        self.store.write_atomic(Artifact::ResultBundle, |file| {
            size = self.service.download_results(job_id, file)?;
            Ok(())
        })?;
        info!(job_id, bytes = size, "compose results downloaded");
        Ok(())
    }

    /// Decompress the disk image member of the result bundle into `disk.raw`.
    pub fn unpack_results(&self, job_id: &str) -> Result<()> {
        if self.store.exists(Artifact::RawImage) {
            return Ok(());
        }
        let member = format!("{job_id}{}", self.settings.image_suffix);
        let bundle = self.store.path(Artifact::ResultBundle);
        info!(member = %member, "unpacking disk image");
        self.store.write_atomic(Artifact::RawImage, |out| {
            unpack_member(&bundle, &member, self.xz_tool, out)
        })
    }
}

fn unpack_member(bundle: &Path, member: &str, xz_tool: &str, out: &mut File) -> Result<()> {
    let ctx = || format!("reading result bundle '{}'", bundle.display());
    let file = match File::open(bundle) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ComposeError::NotFound(format!(
                "checkpoint '{}'",
                Artifact::ResultBundle
            )))
        }
        Err(e) => return Err(e).io_context(ctx),
    };

    let mut archive = tar::Archive::new(BufReader::new(file));
    for entry in archive.entries().io_context(ctx)? {
        let mut entry = entry.io_context(ctx)?;
        let path = entry.path().io_context(ctx)?.into_owned();
        let name = path.to_string_lossy();
        if name.trim_start_matches("./") != member {
            continue;
        }
        if !entry.header().entry_type().is_file() {
            return Err(ComposeError::InvalidImage(format!(
                "result bundle member '{member}' is not a regular file"
            )));
        }
        let codec = Compression::from_file_name(member);
        let written = codec::decompress(codec, xz_tool, &mut entry, out)?;
        debug!(member, codec = %codec, bytes = written, "disk image unpacked");
        return Ok(());
    }
    Err(ComposeError::NotFound(format!(
        "member '{member}' in result bundle '{}'",
        bundle.display()
    )))
}

/// Job ids end up in URL paths and file names.
fn check_job_id(job_id: &str, source: &str) -> Result<()> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ComposeError::parse(
            source,
            format!("'{job_id}' is not a valid compose id"),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Read;

    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    pub(crate) const JOB: &str = "2f6d1c4e-8b3a-4f7e-9d21-5c0b7a9e3f18";

    /// In-memory compose service. Statuses are served in order; the last
    /// one repeats.
    #[derive(Default)]
    pub(crate) struct FakeService {
        pub statuses: RefCell<VecDeque<String>>,
        pub bundle: Vec<u8>,
        pub calls: RefCell<Vec<String>>,
        pub pushed: RefCell<Vec<String>>,
        pub requests: RefCell<Vec<BuildRequest>>,
    }

    impl FakeService {
        pub(crate) fn new(statuses: &[&str], bundle: Vec<u8>) -> Self {
            Self {
                statuses: RefCell::new(statuses.iter().map(|s| s.to_string()).collect()),
                bundle,
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl ComposeService for FakeService {
        fn push_blueprint(&self, toml: &str) -> Result<()> {
            self.calls.borrow_mut().push("push".into());
            self.pushed.borrow_mut().push(toml.to_string());
            Ok(())
        }

        fn submit(&self, request: &BuildRequest) -> Result<String> {
            self.calls.borrow_mut().push("submit".into());
            self.requests.borrow_mut().push(request.clone());
            Ok(JOB.to_string())
        }

        fn queue_status(&self, _job_id: &str) -> Result<String> {
            self.calls.borrow_mut().push("status".into());
            let mut statuses = self.statuses.borrow_mut();
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().cloned()
            };
            Ok(status.unwrap_or_else(|| "FINISHED".into()))
        }

        fn download_results(&self, _job_id: &str, out: &mut dyn Write) -> Result<u64> {
            self.calls.borrow_mut().push("results".into());
            out.write_all(&self.bundle)
                .io_context(|| "writing fake results")?;
            Ok(self.bundle.len() as u64)
        }
    }

    /// A result bundle holding `<JOB>-disk.raw.gz` with `image` inside.
    pub(crate) fn gzip_bundle(image: &[u8]) -> Vec<u8> {
        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(image).unwrap();
        let packed = gz.finish().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, &format!("{JOB}.json"), b"{}");
        append(&mut builder, &format!("{JOB}-disk.raw.gz"), &packed);
        builder.into_inner().unwrap()
    }

    fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    pub(crate) fn gzip_settings() -> ServiceConfig {
        ServiceConfig {
            image_suffix: "-disk.raw.gz".into(),
            ..ServiceConfig::default()
        }
    }

    fn blueprint() -> Blueprint {
        Blueprint {
            name: "verity-root".into(),
            text: "name = \"verity-root\"\n".into(),
        }
    }

    struct Fixture {
        _tmp: TempDir,
        store: CheckpointStore,
        settings: ServiceConfig,
        tools: ToolsConfig,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path()).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            settings: gzip_settings(),
            tools: ToolsConfig::default(),
        }
    }

    impl Fixture {
        fn client<'a>(&'a self, service: &'a FakeService) -> RemoteJobClient<'a> {
            RemoteJobClient::new(service, &self.store, &self.settings, &self.tools)
                .with_poll_interval(Duration::ZERO)
        }
    }

    #[test]
    fn status_labels_map_case_insensitively() {
        assert_eq!(JobStatus::from_label("WAITING"), JobStatus::Queued);
        assert_eq!(JobStatus::from_label("pending"), JobStatus::Queued);
        assert_eq!(JobStatus::from_label("Queued"), JobStatus::Queued);
        assert_eq!(JobStatus::from_label("RUNNING"), JobStatus::Running);
        assert_eq!(JobStatus::from_label("building"), JobStatus::Running);
        assert_eq!(JobStatus::from_label("FINISHED"), JobStatus::Finished);
        assert_eq!(JobStatus::from_label("success"), JobStatus::Finished);
        assert_eq!(JobStatus::from_label("FAILED"), JobStatus::Failed);
        assert_eq!(
            JobStatus::from_label("CANCELED"),
            JobStatus::Unknown("CANCELED".into())
        );
        assert!(JobStatus::from_label("CANCELED").is_terminal());
        assert!(!JobStatus::from_label("running").is_terminal());
    }

    #[test]
    fn submit_persists_id_and_resumes() {
        let fx = fixture();
        let service = FakeService::default();

        let id = fx.client(&service).submit(&blueprint()).unwrap();
        assert_eq!(id, JOB);
        assert_eq!(fx.store.read_to_string(Artifact::ComposeId).unwrap(), JOB);
        assert_eq!(
            service.requests.borrow()[0],
            BuildRequest {
                blueprint_name: "verity-root".into(),
                compose_type: "raw".into(),
                branch: "master".into(),
            }
        );

        let again = fx.client(&service).submit(&blueprint()).unwrap();
        assert_eq!(again, JOB);
        assert_eq!(service.calls(), vec!["push", "submit"]);
    }

    #[test]
    fn polls_until_finished() {
        let fx = fixture();
        let service = FakeService::new(&["WAITING", "RUNNING", "RUNNING", "FINISHED"], vec![]);
        fx.client(&service).await_terminal(JOB).unwrap();
        assert_eq!(service.calls().len(), 4);
    }

    #[test]
    fn failed_and_unknown_statuses_are_terminal_failures() {
        let fx = fixture();
        for label in ["FAILED", "failed", "CANCELED"] {
            let service = FakeService::new(&["RUNNING", label], vec![]);
            match fx.client(&service).await_terminal(JOB).unwrap_err() {
                ComposeError::RemoteJob { job_id, status } => {
                    assert_eq!(job_id, JOB);
                    assert_eq!(status, label);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn fetch_and_unpack_disk_image() {
        let fx = fixture();
        let service = FakeService::new(&["FINISHED"], gzip_bundle(b"raw disk bytes"));
        let client = fx.client(&service);

        client.fetch_results(JOB).unwrap();
        client.unpack_results(JOB).unwrap();
        assert_eq!(fx.store.read(Artifact::RawImage).unwrap(), b"raw disk bytes");

        // Committed outputs are not fetched again.
        client.fetch_results(JOB).unwrap();
        client.unpack_results(JOB).unwrap();
        assert_eq!(service.calls(), vec!["results"]);
    }

    #[test]
    fn fetch_streams_into_checkpoint() {
        let fx = fixture();
        let bundle = gzip_bundle(b"x");
        let service = FakeService::new(&["FINISHED"], bundle.clone());
        fx.client(&service).fetch_results(JOB).unwrap();

        let mut stored = Vec::new();
        File::open(fx.store.path(Artifact::ResultBundle))
            .unwrap()
            .read_to_end(&mut stored)
            .unwrap();
        assert_eq!(stored, bundle);
    }

    #[test]
    fn missing_member_is_not_found() {
        let fx = fixture();
        let service = FakeService::new(&["FINISHED"], gzip_bundle(b"x"));
        let client = fx.client(&service);
        client.fetch_results("other-job").unwrap();

        let err = client.unpack_results("other-job").unwrap_err();
        assert!(matches!(err, ComposeError::NotFound(_)), "{err}");
        assert!(!fx.store.exists(Artifact::RawImage));
    }

    #[test]
    fn directory_member_is_invalid_image() {
        let fx = fixture();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{JOB}-disk.raw.gz"), std::io::empty())
            .unwrap();
        let service = FakeService::new(&["FINISHED"], builder.into_inner().unwrap());
        let client = fx.client(&service);
        client.fetch_results(JOB).unwrap();

        let err = client.unpack_results(JOB).unwrap_err();
        assert!(matches!(err, ComposeError::InvalidImage(_)), "{err}");
    }

    #[test]
    fn corrupt_compose_id_is_rejected() {
        let fx = fixture();
        fx.store
            .write_string(Artifact::ComposeId, "../../etc/passwd")
            .unwrap();
        let service = FakeService::default();
        let err = fx.client(&service).job_id().unwrap_err();
        assert!(matches!(err, ComposeError::Parse { .. }));
    }
}
