//! Content dispatcher: the request-facing entry point of the pipeline.
//!
//! A request is classified by its pathname, served from the cache when a
//! fresh entry exists, and otherwise computed exactly once per key while
//! concurrent requests for the same key wait on that computation.
//! Requests the pipeline does not recognize are handed back untouched.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::packages::VendoredPackages;
use crate::plugin::module_cache::ModuleCache;
use crate::plugin::sfc_loader::{SfcLoader, SfcLoaderConfig};
use crate::plugin::single_flight::SingleFlight;
use crate::plugin::{ComponentCompiler, ModuleRewriter, PackageResolver, ScriptPreprocessor};
use crate::rewrite::ImportRewriter;
use crate::sfc::SfcCompiler;
use crate::source::ResourceReader;
use crate::utils::{self, RequestKind, JS_CONTENT_TYPE};
use crate::{Payload, PipelineConfig, Result};

// ---------------------------------------------------------------------------
// Request / response surface
// ---------------------------------------------------------------------------

/// The parts of an incoming request the pipeline looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevRequest {
    pub method: String,
    /// Percent-decoded URL pathname; the cache key.
    pub path: String,
    pub query: Option<String>,
}

impl DevRequest {
    /// Build from a raw request target such as `/App.vue?t=1`. The pathname
    /// is decoded before any containment check sees it.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = utils::split_request_target(target);
        Self {
            method: method.into(),
            path: utils::decode_pathname(path),
            query: query.map(str::to_string),
        }
    }

    pub fn get(target: &str) -> Self {
        Self::new("GET", target)
    }
}

/// Where a handled request's response goes.
pub trait ResponseSink: Send {
    fn set_header(&mut self, name: &str, value: &str);
    /// Write the body and finish the response.
    fn end(&mut self, body: Payload);
}

/// A response collected in memory, for hosts that build their own reply.
#[derive(Debug, Default, Clone)]
pub struct BufferedResponse {
    pub headers: Vec<(String, String)>,
    pub body: Option<Payload>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value set for `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_ended(&self) -> bool {
        self.body.is_some()
    }
}

impl ResponseSink for BufferedResponse {
    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn end(&mut self, body: Payload) {
        self.body = Some(body);
    }
}

/// Outcome of [`ContentDispatcher::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A response was written.
    Handled,
    /// Not ours; the host should pass the request on.
    Next,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// A freshly computed payload and the source timestamp it was built from.
struct Computed {
    payload: Payload,
    source_timestamp: Option<SystemTime>,
}

impl Computed {
    fn file_backed(payload: String, last_modified: SystemTime) -> Self {
        Self {
            payload: Payload::from(payload),
            source_timestamp: Some(last_modified),
        }
    }

    fn virtual_package(payload: String) -> Self {
        Self {
            payload: Payload::from(payload),
            source_timestamp: None,
        }
    }
}

/// Classifies requests and serves components, scripts and virtual packages.
pub struct ContentDispatcher {
    config: PipelineConfig,
    reader: ResourceReader,
    cache: Option<ModuleCache>,
    flights: SingleFlight,
    transformer: SfcLoader,
    rewriter: Arc<dyn ModuleRewriter>,
    packages: Arc<dyn PackageResolver>,
}

impl std::fmt::Debug for ContentDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDispatcher")
            .field("config", &self.config)
            .field("root", &self.reader.root())
            .field("cache", &self.cache)
            .field("transformer", &self.transformer)
            .finish()
    }
}

impl ContentDispatcher {
    /// Dispatcher over `root` with the built-in compiler, import rewriter
    /// and vendored package table.
    pub fn new(root: impl AsRef<Path>, config: PipelineConfig) -> Self {
        let root = root.as_ref();
        let reader = ResourceReader::new(root);
        let cache = config
            .cache
            .then(|| ModuleCache::new(reader.clone(), config.cache_max_weight));
        let transformer = SfcLoader::new(
            Arc::new(SfcCompiler::new()),
            SfcLoaderConfig {
                source_maps: config.source_maps,
            },
        );
        let packages = VendoredPackages::for_project(root, &config);

        Self {
            config,
            reader,
            cache,
            flights: SingleFlight::new(),
            transformer,
            rewriter: Arc::new(ImportRewriter::new()),
            packages: Arc::new(packages),
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn ComponentCompiler>) -> Self {
        self.transformer = self.transformer.with_compiler(compiler);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ScriptPreprocessor>) -> Self {
        self.transformer = self.transformer.with_preprocessor(preprocessor);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn ModuleRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_package_resolver(mut self, packages: Arc<dyn PackageResolver>) -> Self {
        self.packages = packages;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.reader.root()
    }

    /// The module cache, or `None` when caching is disabled.
    pub fn cache(&self) -> Option<&ModuleCache> {
        self.cache.as_ref()
    }

    /// Serve `request` into `response`, or return [`Dispatch::Next`]
    /// without touching `response` when the path is not ours.
    pub async fn handle(
        &self,
        request: &DevRequest,
        response: &mut dyn ResponseSink,
    ) -> Result<Dispatch> {
        let key = request.path.as_str();

        let payload = match utils::classify(key, &self.config.component_suffix) {
            RequestKind::Component => {
                self.obtain(key, true, || self.compile_component(key))
                    .await?
            }
            RequestKind::Script => self.obtain(key, true, || self.rewrite_script(key)).await?,
            RequestKind::VirtualModule(package) => {
                self.obtain(key, false, || self.resolve_package(package))
                    .await?
            }
            RequestKind::Unhandled => return Ok(Dispatch::Next),
        };

        response.set_header("Content-Type", JS_CONTENT_TYPE);
        response.end(payload);
        Ok(Dispatch::Handled)
    }

    /// Cached payload for `key`, or the result of the single shared
    /// computation for it. Only successful results are stored.
    async fn obtain<F, Fut>(&self, key: &str, check_freshness: bool, compute: F) -> Result<Payload>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Computed>>,
    {
        let Some(cache) = &self.cache else {
            return compute().await.map(|computed| computed.payload);
        };

        if let Some(payload) = cache.try_get(key, check_freshness).await {
            return Ok(payload);
        }
        debug!(key, "cache miss");

        self.flights
            .run(key, || async move {
                let computed = compute().await?;
                cache.put(
                    key,
                    Arc::clone(&computed.payload),
                    computed.source_timestamp,
                );
                Ok(computed.payload)
            })
            .await
    }

    async fn compile_component(&self, key: &str) -> Result<Computed> {
        let resource = self.reader.read(key).await?;
        let code = self
            .transformer
            .transform(&resource.filepath, &resource.raw_source)?;
        debug!(key, "compiled component");
        Ok(Computed::file_backed(code, resource.last_modified))
    }

    async fn rewrite_script(&self, key: &str) -> Result<Computed> {
        let resource = self.reader.read(key).await?;
        let code = self.rewriter.rewrite(&resource.raw_source)?;
        Ok(Computed::file_backed(code, resource.last_modified))
    }

    async fn resolve_package(&self, package: &str) -> Result<Computed> {
        let bytes = self.packages.resolve(package).await?;
        let code = String::from_utf8_lossy(&bytes).into_owned();
        debug!(package, "resolved virtual package");
        Ok(Computed::virtual_package(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;
    use std::fs;

    fn dispatcher(root: &Path) -> ContentDispatcher {
        ContentDispatcher::new(root, PipelineConfig::default())
    }

    #[test]
    fn request_splits_query() {
        let request = DevRequest::get("/App.vue?t=1");
        assert_eq!(request.path, "/App.vue");
        assert_eq!(request.query.as_deref(), Some("t=1"));
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn request_path_is_percent_decoded() {
        let request = DevRequest::get("/my%20lib/caf%C3%A9.js?q=%20");
        assert_eq!(request.path, "/my lib/café.js");
        assert_eq!(request.query.as_deref(), Some("q=%20"));
    }

    #[tokio::test]
    async fn encoded_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let mut response = BufferedResponse::new();

        let err = dispatcher
            .handle(&DevRequest::get("/%2e%2e/secret.js"), &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PathEscapesRoot { .. }));
        assert!(!response.is_ended());
    }

    #[test]
    fn buffered_header_lookup_is_case_insensitive() {
        let mut response = BufferedResponse::new();
        response.set_header("Content-Type", "text/plain");
        response.set_header("content-type", JS_CONTENT_TYPE);
        assert_eq!(response.header("CONTENT-TYPE"), Some(JS_CONTENT_TYPE));
        assert!(!response.is_ended());
    }

    #[tokio::test]
    async fn unhandled_path_is_delegated() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let mut response = BufferedResponse::new();

        let outcome = dispatcher
            .handle(&DevRequest::get("/index.html"), &mut response)
            .await
            .unwrap();
        assert_eq!(outcome, Dispatch::Next);
        assert!(response.headers.is_empty());
        assert!(!response.is_ended());
    }

    #[tokio::test]
    async fn script_is_rewritten_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), "import v from 'vue'\n").unwrap();
        let dispatcher = dispatcher(dir.path());
        let mut response = BufferedResponse::new();

        let outcome = dispatcher
            .handle(&DevRequest::get("/main.js?v=2"), &mut response)
            .await
            .unwrap();
        assert_eq!(outcome, Dispatch::Handled);
        assert_eq!(response.header("Content-Type"), Some(JS_CONTENT_TYPE));
        assert_eq!(
            response.body.as_deref(),
            Some("import v from '/__modules/vue'\n")
        );
        assert!(dispatcher.cache().unwrap().contains("/main.js"));
    }

    #[tokio::test]
    async fn missing_file_propagates_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let mut response = BufferedResponse::new();

        let err = dispatcher
            .handle(&DevRequest::get("/missing.js"), &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert!(!response.is_ended());
        assert!(dispatcher.cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let mut response = BufferedResponse::new();

        let err = dispatcher
            .handle(&DevRequest::get("/../secret.js"), &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PathEscapesRoot { .. }));
    }

    #[tokio::test]
    async fn cache_disabled_has_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.js"), "export default 1").unwrap();
        let dispatcher =
            ContentDispatcher::new(dir.path(), PipelineConfig::default().with_cache(false));
        assert!(dispatcher.cache().is_none());

        let mut response = BufferedResponse::new();
        dispatcher
            .handle(&DevRequest::get("/a.js"), &mut response)
            .await
            .unwrap();
        assert_eq!(response.body.as_deref(), Some("export default 1"));
    }
}
