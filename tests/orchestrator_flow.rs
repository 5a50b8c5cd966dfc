//! Integration tests for the initialization pipeline.
//!
//! Collaborators are hand-written fakes; the service is a real `/bin/sh`
//! process managed by the real supervisor.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::sync::broadcast;
use tokio::time::timeout;

use vault_pilot::collaborators::{
    AppProcess, ConfigurationStore, Credential, CredentialService, DataInfo, DataStoreDecryptor,
    ExternalAppDetector, ProgressReporter,
};
use vault_pilot::config::{OrchestratorConfig, ServiceConfig, SupervisorConfig};
use vault_pilot::error::{CredentialError, DecryptionError, DetectionError};
use vault_pilot::onboarding::{
    InitOrchestrator, OrchestrationState, OrchestratorEvent, ServiceDependencies, Step,
    StepStatus,
};
use vault_pilot::store::MemoryConfigStore;
use vault_pilot::supervisor::{ProcessState, ProcessSupervisor};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const KEY: &str = "00112233445566778899aabbccddeeff";

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeDetector {
    running: AtomicBool,
    hangs: AtomicBool,
    is_running_calls: AtomicUsize,
    detect_calls: AtomicUsize,
}

#[async_trait]
impl ExternalAppDetector for FakeDetector {
    async fn is_running(&self) -> bool {
        self.is_running_calls.fetch_add(1, Ordering::SeqCst);
        if self.hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.running.load(Ordering::SeqCst)
    }

    async fn detect_processes(&self) -> Result<Vec<AppProcess>, DetectionError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![AppProcess {
            pid: 4242,
            name: "FakeApp".into(),
            executable_path: PathBuf::from("/opt/fake/FakeApp"),
        }])
    }

    async fn detect_data_directory(&self) -> Result<DataInfo, DetectionError> {
        Ok(DataInfo {
            data_dir: PathBuf::from("/home/user/FakeApp/data"),
            account: Some("wxid_test".into()),
        })
    }
}

/// Fails the first `failures` calls, then returns [`KEY`].
#[derive(Default)]
struct FakeCredentials {
    calls: AtomicUsize,
    failures: AtomicUsize,
}

#[async_trait]
impl CredentialService for FakeCredentials {
    async fn obtain_credential(&self, executable_path: &Path) -> Result<Credential, CredentialError> {
        assert_eq!(executable_path, Path::new("/opt/fake/FakeApp"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CredentialError::Denied("debugger attach refused".into()));
        }
        Ok(Credential::new(KEY))
    }
}

#[derive(Default)]
struct FakeDecryptor {
    calls: AtomicUsize,
    decrypted: AtomicBool,
    delay: Option<Duration>,
}

#[async_trait]
impl DataStoreDecryptor for FakeDecryptor {
    async fn decrypt(
        &self,
        _source_dir: &Path,
        work_dir: &Path,
        credential: &Credential,
        _executable_path: &Path,
        progress: ProgressReporter,
    ) -> Result<(), DecryptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(credential.secret().expose_secret(), KEY);
        assert!(work_dir.is_dir(), "work dir should exist before decryption");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        progress.report(30);
        progress.report(70);
        self.decrypted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn check_decrypted(&self, _work_dir: &Path) -> bool {
        self.decrypted.load(Ordering::SeqCst)
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    orchestrator: InitOrchestrator,
    detector: Arc<FakeDetector>,
    credentials: Arc<FakeCredentials>,
    decryptor: Arc<FakeDecryptor>,
    store: Arc<MemoryConfigStore>,
    supervisor: ProcessSupervisor,
    events: broadcast::Receiver<OrchestratorEvent>,
    _tmp: tempfile::TempDir,
    work_dir: PathBuf,
}

struct Setup {
    app_running: bool,
    credential_failures: usize,
    default_work_dir: bool,
    decrypt_delay: Option<Duration>,
    detector_hangs: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            app_running: true,
            credential_failures: 0,
            default_work_dir: true,
            decrypt_delay: None,
            detector_hangs: false,
        }
    }
}

fn service_config() -> ServiceConfig {
    let mut service = ServiceConfig::new("/bin/sh");
    service.base_args = vec!["-c".into(), "exec sleep 30".into(), "fake-service".into()];
    service.startup_timeout = Duration::from_secs(5);
    service.settle = Duration::from_millis(50);
    service
}

fn harness(setup: Setup) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let work_dir = tmp.path().join("work");

    let detector = Arc::new(FakeDetector::default());
    detector.running.store(setup.app_running, Ordering::SeqCst);
    detector.hangs.store(setup.detector_hangs, Ordering::SeqCst);
    let credentials = Arc::new(FakeCredentials::default());
    credentials
        .failures
        .store(setup.credential_failures, Ordering::SeqCst);
    let decryptor = Arc::new(FakeDecryptor {
        delay: setup.decrypt_delay,
        ..FakeDecryptor::default()
    });
    let store = Arc::new(MemoryConfigStore::new());
    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        grace_period: Duration::from_millis(500),
        ..SupervisorConfig::default()
    });

    let mut config = OrchestratorConfig::new(service_config());
    config.app_name = "FakeApp".into();
    config.detect_timeout = Duration::from_millis(200);
    if setup.default_work_dir {
        config.default_work_dir = Some(work_dir.clone());
    }

    let orchestrator = InitOrchestrator::new(
        config,
        ServiceDependencies {
            detector: detector.clone(),
            credentials: credentials.clone(),
            decryptor: decryptor.clone(),
            store: store.clone(),
            supervisor: supervisor.clone(),
        },
    );
    let events = orchestrator.subscribe();

    Harness {
        orchestrator,
        detector,
        credentials,
        decryptor,
        store,
        supervisor,
        events,
        _tmp: tmp,
        work_dir,
    }
}

impl Harness {
    /// Everything broadcast so far.
    fn drain(&mut self) -> Vec<OrchestratorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn shutdown(&self) {
        self.supervisor.stop(true).await.unwrap();
    }
}

fn snapshots(events: &[OrchestratorEvent]) -> Vec<&OrchestrationState> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect()
}

fn ever_in_progress(events: &[OrchestratorEvent], step: Step) -> bool {
    snapshots(events)
        .iter()
        .any(|s| s.step(step).status == StepStatus::InProgress)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_completes_and_persists() {
    let mut h = harness(Setup::default());

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    assert!(state.is_completed);
    assert!(state.can_exit);
    assert_eq!(state.current_step, Step::Completed);
    assert_eq!(state.overall_progress, 100);
    for step in Step::ALL {
        assert_eq!(state.step(step).status, StepStatus::Success, "{step}");
    }

    let events = h.drain();
    assert_eq!(events.last(), Some(&OrchestratorEvent::Completed));
    assert!(matches!(
        events[events.len() - 2],
        OrchestratorEvent::StateChanged { .. }
    ));

    // Progress never leaves 0..=100 and never goes backwards within the run.
    let overall: Vec<u8> = snapshots(&events).iter().map(|s| s.overall_progress).collect();
    assert!(overall.iter().all(|p| *p <= 100));
    assert!(overall.windows(2).all(|w| w[0] <= w[1]), "{overall:?}");

    // Decryption progress was forwarded.
    let decrypt_progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StepProgress {
                step: Step::DecryptingStore,
                progress,
            } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(decrypt_progress, vec![0, 30, 70, 100]);

    assert_eq!(
        h.store.credential().await.unwrap().unwrap().secret().expose_secret(),
        KEY
    );
    assert_eq!(h.store.work_dir().await.unwrap(), Some(h.work_dir.clone()));
    assert_eq!(
        h.store.service_address().await.unwrap().as_deref(),
        Some("http://127.0.0.1:5030")
    );
    assert_eq!(h.supervisor.status().await, ProcessState::Running);
    assert!(h.supervisor.health_check().await);

    h.shutdown().await;
}

#[tokio::test]
async fn failed_step_aborts_run() {
    let mut h = harness(Setup {
        credential_failures: 1,
        ..Setup::default()
    });

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    assert_eq!(state.current_step, Step::ObtainingCredential);
    assert!(!state.is_completed);
    assert!(!state.can_exit);
    assert_eq!(state.step(Step::DetectingApp).status, StepStatus::Success);
    let failed = state.step(Step::ObtainingCredential);
    assert_eq!(failed.status, StepStatus::Error);
    let message = failed.error.clone().unwrap();
    assert!(message.starts_with("Obtain credential: "), "{message}");

    let events = h.drain();
    assert!(events.contains(&OrchestratorEvent::Error {
        step: Step::ObtainingCredential,
        message,
    }));
    assert!(!events.contains(&OrchestratorEvent::Completed));
    for later in [Step::SelectingWorkDir, Step::DecryptingStore, Step::StartingService] {
        assert!(!ever_in_progress(&events, later), "{later} must not start");
    }
    assert_eq!(h.decryptor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.supervisor.status().await, ProcessState::Stopped);
}

#[tokio::test]
async fn retry_reruns_only_the_failed_step() {
    let mut h = harness(Setup {
        credential_failures: 1,
        ..Setup::default()
    });

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");
    h.drain();

    timeout(TEST_TIMEOUT, h.orchestrator.retry_current_step())
        .await
        .expect("retry hung");

    let state = h.orchestrator.get_state().await;
    assert!(state.is_completed);
    assert_eq!(h.detector.detect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 2);

    let events = h.drain();
    assert!(!ever_in_progress(&events, Step::DetectingApp));
    assert!(
        snapshots(&events)
            .iter()
            .all(|s| s.step(Step::DetectingApp).status == StepStatus::Success)
    );
    assert_eq!(events.last(), Some(&OrchestratorEvent::Completed));

    // Nothing left to retry once completed.
    h.orchestrator.retry_current_step().await;
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 2);

    h.shutdown().await;
}

#[tokio::test]
async fn missing_app_pauses_until_retry() {
    let mut h = harness(Setup {
        app_running: false,
        ..Setup::default()
    });

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    let detecting = state.step(Step::DetectingApp);
    assert_eq!(state.current_step, Step::DetectingApp);
    assert_eq!(detecting.status, StepStatus::WaitingUserInput);
    assert!(detecting.user_action.as_deref().unwrap().contains("FakeApp"));
    assert!(detecting.error.is_none());
    let events = h.drain();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Error { .. })),
        "a pause is not an error"
    );

    h.detector.running.store(true, Ordering::SeqCst);
    timeout(TEST_TIMEOUT, h.orchestrator.retry_current_step())
        .await
        .expect("retry hung");

    let state = h.orchestrator.get_state().await;
    assert!(state.is_completed);
    assert!(state.step(Step::DetectingApp).user_action.is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn hung_detector_fails_with_timeout() {
    let mut h = harness(Setup {
        detector_hangs: true,
        ..Setup::default()
    });

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    let detecting = state.step(Step::DetectingApp);
    assert_eq!(detecting.status, StepStatus::Error);
    assert!(detecting.user_action.is_none());
    let message = detecting.error.clone().unwrap();
    assert!(message.starts_with("Detect application: "), "{message}");
    assert!(message.contains("timed out"), "{message}");

    let events = h.drain();
    assert!(events.contains(&OrchestratorEvent::Error {
        step: Step::DetectingApp,
        message,
    }));
    assert_eq!(h.detector.detect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.supervisor.status().await, ProcessState::Stopped);
}

#[tokio::test]
async fn work_dir_choice_resumes_paused_run() {
    let mut h = harness(Setup {
        default_work_dir: false,
        ..Setup::default()
    });

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    assert_eq!(state.current_step, Step::SelectingWorkDir);
    assert_eq!(
        state.step(Step::SelectingWorkDir).status,
        StepStatus::WaitingUserInput
    );
    h.drain();

    let chosen = h.work_dir.join("chosen");
    timeout(TEST_TIMEOUT, h.orchestrator.set_work_dir(&chosen))
        .await
        .expect("resume hung");

    let state = h.orchestrator.get_state().await;
    assert!(state.is_completed);
    assert!(chosen.is_dir());
    assert_eq!(h.store.work_dir().await.unwrap(), Some(chosen));
    // Earlier steps were not repeated.
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn fast_path_skips_credential_and_decryption() {
    let mut h = harness(Setup::default());
    std::fs::create_dir_all(&h.work_dir).unwrap();
    h.store.set_credential(&Credential::new(KEY)).await.unwrap();
    h.store.set_work_dir(&h.work_dir).await.unwrap();
    h.decryptor.decrypted.store(true, Ordering::SeqCst);

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    let state = h.orchestrator.get_state().await;
    assert!(state.is_completed);
    assert_eq!(state.overall_progress, 100);

    let events = h.drain();
    assert_eq!(events.last(), Some(&OrchestratorEvent::Completed));
    assert!(!ever_in_progress(&events, Step::ObtainingCredential));
    assert!(!ever_in_progress(&events, Step::DecryptingStore));
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.decryptor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.detector.is_running_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.supervisor.status().await, ProcessState::Running);

    h.shutdown().await;
}

#[tokio::test]
async fn fast_path_falls_back_without_decrypted_data() {
    let h = harness(Setup::default());
    h.store.set_credential(&Credential::new(KEY)).await.unwrap();
    h.store.set_work_dir(&h.work_dir).await.unwrap();

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("run hung");

    assert!(h.orchestrator.get_state().await.is_completed);
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.decryptor.calls.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn concurrent_start_is_ignored() {
    let h = harness(Setup {
        decrypt_delay: Some(Duration::from_millis(200)),
        ..Setup::default()
    });

    let first = h.orchestrator.clone();
    let second = h.orchestrator.clone();
    timeout(TEST_TIMEOUT, async {
        tokio::join!(first.start_initialization(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(second.is_running());
            second.start_initialization().await;
        })
    })
    .await
    .expect("runs hung");

    assert!(h.orchestrator.get_state().await.is_completed);
    assert!(!h.orchestrator.is_running());
    assert_eq!(h.detector.detect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.decryptor.calls.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn rerun_replaces_running_service() {
    let h = harness(Setup::default());

    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("first run hung");
    let first_pid = h.supervisor.process_info().await.pid.unwrap();

    // Decrypted data is now in place, so the second run takes the fast path.
    timeout(TEST_TIMEOUT, h.orchestrator.start_initialization())
        .await
        .expect("second run hung");
    let info = h.supervisor.process_info().await;

    assert!(h.orchestrator.get_state().await.is_completed);
    assert_eq!(info.state, ProcessState::Running);
    assert_ne!(info.pid.unwrap(), first_pid);
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}
