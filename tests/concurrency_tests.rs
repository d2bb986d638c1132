use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sfc_dev_server::plugin::{CompiledBlock, CompiledDescriptor, ComponentCompiler, PackageResolver};
use sfc_dev_server::{
    BufferedResponse, ContentDispatcher, DevRequest, PipelineConfig, PipelineError, Result,
};

const CONCURRENT_REQUESTS: usize = 16;

/// Resolves every name after a delay, counting calls. `fail` names are
/// reported as unprovisioned.
struct SlowResolver {
    calls: AtomicUsize,
    fail: &'static [&'static str],
}

#[async_trait]
impl PackageResolver for SlowResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fail.iter().any(|f| *f == name) {
            return Err(PipelineError::UnsupportedPackage {
                name: name.to_string(),
            });
        }
        Ok(format!("export default '{name}'").into_bytes())
    }
}

fn slow_resolver(fail: &'static [&'static str]) -> Arc<SlowResolver> {
    Arc::new(SlowResolver {
        calls: AtomicUsize::new(0),
        fail,
    })
}

async fn request_concurrently(
    dispatcher: &Arc<ContentDispatcher>,
    target: &'static str,
) -> Vec<Result<String>> {
    let tasks: Vec<_> = (0..CONCURRENT_REQUESTS)
        .map(|_| {
            let dispatcher = Arc::clone(dispatcher);
            tokio::spawn(async move {
                let mut response = BufferedResponse::new();
                dispatcher
                    .handle(&DevRequest::get(target), &mut response)
                    .await?;
                Ok::<_, PipelineError>(response.body.as_deref().unwrap_or_default().to_string())
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.expect("request task panicked"));
    }
    results
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test]
async fn concurrent_cold_requests_resolve_once() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = slow_resolver(&[]);
    let dispatcher = Arc::new(
        ContentDispatcher::new(dir.path(), PipelineConfig::default())
            .with_package_resolver(resolver.clone()),
    );

    let results = request_concurrently(&dispatcher, "/__modules/vue").await;
    for result in results {
        assert_eq!(result.unwrap(), "export default 'vue'");
    }
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert!(dispatcher.cache().unwrap().contains("/__modules/vue"));
}

#[tokio::test]
async fn concurrent_failures_are_shared_and_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = slow_resolver(&["left-pad"]);
    let dispatcher = Arc::new(
        ContentDispatcher::new(dir.path(), PipelineConfig::default())
            .with_package_resolver(resolver.clone()),
    );

    let results = request_concurrently(&dispatcher, "/__modules/left-pad").await;
    for result in results {
        assert!(matches!(
            result,
            Err(PipelineError::UnsupportedPackage { ref name }) if name == "left-pad"
        ));
    }
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert!(dispatcher.cache().unwrap().is_empty());

    // The failure does not stick: the next request tries again.
    let mut response = BufferedResponse::new();
    assert!(dispatcher
        .handle(&DevRequest::get("/__modules/left-pad"), &mut response)
        .await
        .is_err());
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn distinct_keys_compute_independently() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = slow_resolver(&[]);
    let dispatcher = Arc::new(
        ContentDispatcher::new(dir.path(), PipelineConfig::default())
            .with_package_resolver(resolver.clone()),
    );

    let (a, b) = tokio::join!(
        request_concurrently(&dispatcher, "/__modules/vue"),
        request_concurrently(&dispatcher, "/__modules/preact"),
    );
    assert!(a
        .iter()
        .all(|r| matches!(r.as_deref(), Ok("export default 'vue'"))));
    assert!(b
        .iter()
        .all(|r| matches!(r.as_deref(), Ok("export default 'preact'"))));
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.cache().unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_component_requests_compile_once() {
    struct SlowCompiler {
        compiles: AtomicUsize,
    }

    impl ComponentCompiler for SlowCompiler {
        fn compile_to_descriptor(&self, _: &Path, source: &str) -> CompiledDescriptor {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            CompiledDescriptor {
                script: CompiledBlock::new(source),
                ..Default::default()
            }
        }

        fn assemble(&self, _: &Path, descriptor: &CompiledDescriptor) -> Result<String> {
            Ok(descriptor.script.code.clone())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("App.vue"), "export default {}").unwrap();
    let compiler = Arc::new(SlowCompiler {
        compiles: AtomicUsize::new(0),
    });
    let dispatcher = Arc::new(
        ContentDispatcher::new(dir.path(), PipelineConfig::default())
            .with_compiler(compiler.clone()),
    );

    let results = request_concurrently(&dispatcher, "/App.vue").await;
    for result in results {
        assert_eq!(result.unwrap(), "export default {}");
    }
    // Compilation is synchronous, but the file read before it suspends, so
    // later requests find the flight already running.
    assert_eq!(compiler.compiles.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn without_cache_every_request_computes() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = slow_resolver(&[]);
    let dispatcher = Arc::new(
        ContentDispatcher::new(dir.path(), PipelineConfig::default().with_cache(false))
            .with_package_resolver(resolver.clone()),
    );

    let results = request_concurrently(&dispatcher, "/__modules/vue").await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(resolver.calls.load(Ordering::SeqCst), CONCURRENT_REQUESTS);
}
