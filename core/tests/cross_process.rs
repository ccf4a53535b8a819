//! Two hosts sharing one snapshot file stand in for two processes sharing a
//! container directory.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tether_core::{Outcome, Promise, PromiseError, PromiseHost, PromiseId, RegistrySnapshot};
use tether_store::{FileSnapshotStore, MergeFn, SnapshotStore};

fn host(dir: &tempfile::TempDir) -> PromiseHost<FileSnapshotStore> {
    let store = FileSnapshotStore::open(dir.path().join("promises.json")).unwrap();
    PromiseHost::init(store).unwrap()
}

#[test]
fn resolution_in_one_process_is_delivered_in_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = host(&dir);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let promise = Promise::create(move |outcome| sink.lock().unwrap().push(outcome), a.registry())
        .unwrap();
    let handoff = promise.id().to_string();
    a.flush().unwrap();

    let mut b = host(&dir);
    let id: PromiseId = handoff.parse().unwrap();
    let remote = b.registry().get_promise(&id).expect("record shared through the store");
    remote.resolve(json!("ok")).unwrap();
    b.flush().unwrap();

    let report = a.refresh().unwrap();
    assert_eq!(report.sync.resolved, vec![id]);
    assert_eq!(report.consumed, 1);
    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Fulfilled(json!("ok"))]);
    assert!(a.registry().get_promise(&id).is_none());

    // Later reloads neither redeliver nor resurrect the promise.
    let again = a.refresh().unwrap();
    assert_eq!(again.consumed, 0);
    assert!(again.sync.is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);
    a.flush().unwrap();
    assert!(a.registry().get_promise(&id).is_none());
}

#[test]
fn conflicting_resolutions_surface_on_sync() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = host(&dir);
    let promise = Promise::create_empty(a.registry()).unwrap();
    a.flush().unwrap();

    let b = host(&dir);
    b.registry()
        .get_promise(&promise.id())
        .unwrap()
        .resolve(json!("Y"))
        .unwrap();
    promise.resolve(json!("X")).unwrap();

    let err = a.registry().sync(b.registry()).unwrap_err();
    assert_eq!(err.id(), promise.id());
    assert!(matches!(err, PromiseError::ConflictingResolution { .. }));
    assert_eq!(promise.outcome(), Some(Outcome::Fulfilled(json!("X"))));
}

#[tokio::test]
async fn bridge_completes_after_remote_resolution_is_swept() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = host(&dir);
    let promise = Promise::create_empty(a.registry()).unwrap();
    let bridge = promise.to_bridge();
    a.flush().unwrap();

    let mut b = host(&dir);
    b.registry()
        .get_promise(&promise.id())
        .unwrap()
        .reject(json!({"reason": "declined"}))
        .unwrap();
    b.flush().unwrap();

    assert_eq!(a.refresh().unwrap().consumed, 1);
    assert_eq!(
        bridge.await.unwrap(),
        Outcome::Rejected(json!({"reason": "declined"}))
    );
}

#[test]
fn pending_records_from_both_sides_survive_a_merge() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = host(&dir);
    let mut b = host(&dir);

    let ours = Promise::create_empty(a.registry()).unwrap();
    let theirs = Promise::create_empty(b.registry()).unwrap();
    a.flush().unwrap();
    b.flush().unwrap();

    let reloaded = host(&dir);
    let mut ids = reloaded.registry().ids();
    ids.sort();
    let mut expected = vec![ours.id(), theirs.id()];
    expected.sort();
    assert_eq!(ids, expected);
}

type Hook = Box<dyn FnOnce() + Send>;

/// File store that runs an armed hook while it is inside its locked merge,
/// letting another "process" act at the worst possible moment.
struct HookedStore {
    inner: FileSnapshotStore,
    during_merge: Arc<Mutex<Option<Hook>>>,
}

impl SnapshotStore for HookedStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        self.inner.load()
    }

    fn save(&mut self, snapshot: &RegistrySnapshot) -> Result<()> {
        self.inner.save(snapshot)
    }

    fn update(&mut self, merge: &mut MergeFn<'_>) -> Result<()> {
        let mut hook = self.during_merge.lock().unwrap().take();
        self.inner.update(&mut |latest| {
            if let Some(hook) = hook.take() {
                hook();
            }
            merge(latest)
        })
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[test]
fn concurrent_flush_cannot_drop_another_process_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promises.json");
    let armed: Arc<Mutex<Option<Hook>>> = Arc::default();
    let mut main_app = PromiseHost::init(HookedStore {
        inner: FileSnapshotStore::open(&path).unwrap(),
        during_merge: Arc::clone(&armed),
    })
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let promise = Promise::create(
        move |outcome| sink.lock().unwrap().push(outcome),
        main_app.registry(),
    )
    .unwrap();
    let id = promise.id();
    main_app.flush().unwrap();

    // The extension resolves and flushes once, while the main app sits between
    // reading the store and writing it back.
    let extension: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
    let handle_slot = Arc::clone(&extension);
    let extension_dir = dir.path().to_path_buf();
    *armed.lock().unwrap() = Some(Box::new(move || {
        let handle = thread::spawn(move || {
            let store = FileSnapshotStore::open(extension_dir.join("promises.json")).unwrap();
            let mut host = PromiseHost::init(store).unwrap();
            host.registry().get_promise(&id).unwrap().resolve(json!("ok")).unwrap();
            host.flush().unwrap();
        });
        thread::sleep(Duration::from_millis(200));
        *handle_slot.lock().unwrap() = Some(handle);
    }));

    Promise::create_empty(main_app.registry()).unwrap();
    main_app.flush().unwrap();
    extension.lock().unwrap().take().unwrap().join().unwrap();

    let stored = FileSnapshotStore::open(&path).unwrap().load().unwrap().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(
        stored.get(&id).unwrap().outcome(),
        Some(&Outcome::Fulfilled(json!("ok")))
    );

    assert_eq!(main_app.refresh().unwrap().consumed, 1);
    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Fulfilled(json!("ok"))]);
}
