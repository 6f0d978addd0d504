use std::rc::Rc;
use std::time::Duration;

use enclave::{
    BundleRequest, ContextOptions, HostPage, IsolatedContext, LoadError, LoaderConfig,
    ModuleLoader, StaticFetcher,
};
use serde_json::json;

fn setup() -> (HostPage, ModuleLoader, Rc<StaticFetcher>) {
    let fetcher = Rc::new(StaticFetcher::new());
    let host = HostPage::new(LoaderConfig::default(), fetcher.clone()).expect("host page");
    let loader = ModuleLoader::new(&host).expect("loader");
    (host, loader, fetcher)
}

/// A bundle as the build wraps it: it registers through the global hook and
/// names its own script element.
fn bundle(id: &str, body: &str) -> String {
    format!(
        "__ENCLAVE_GLOBAL_HOOK__({id:?}, function (require, module, exports, context) {{\n{body}\n}}, document.currentScript);\n"
    )
}

#[tokio::test]
async fn resolves_exports_registered_through_the_hook() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert("/a.js", bundle("a", "module.exports = { x: 1 };"));

    let exports = loader
        .require_ensure(BundleRequest::new("a", "/a.js"))
        .await
        .expect("load a");

    assert_eq!(exports.to_json().unwrap(), json!({"x": 1}));
    assert!(loader.is_resolved("a"));
    assert!(!loader.is_pending("a"));
}

#[tokio::test]
async fn concurrent_requests_share_one_fetch() {
    let (host, loader, fetcher) = setup();
    fetcher.insert("/b.js", bundle("b", "module.exports = { created: Date.now() };"));

    let (first, second) = tokio::join!(
        loader.require_ensure(BundleRequest::new("b", "/b.js")),
        loader.require_ensure(BundleRequest::new("b", "/b.js")),
    );
    let first = first.expect("first request");
    let second = second.expect("second request");

    assert!(first.same_value(&second));
    assert_eq!(fetcher.request_count("/b.js"), 1);
    assert_eq!(host.script_tags("/b.js").len(), 1);
}

#[tokio::test]
async fn script_tags_carry_the_record_uuid() {
    let (host, loader, fetcher) = setup();
    fetcher.insert("/tagged.js", bundle("tagged", "module.exports = {};"));

    loader
        .require_ensure(BundleRequest::new("tagged", "/tagged.js"))
        .await
        .expect("load");

    let tags = host.script_tags("/tagged.js");
    assert_eq!(tags.len(), 1);
    let uuid = host.get_attribute(tags[0], "data-uuid").unwrap();
    assert_eq!(uuid, loader.record_uuid(&enclave::loader::RecordKey::module("tagged")));
    assert_eq!(
        host.get_attribute(tags[0], "data-from").unwrap().as_deref(),
        Some("enclave")
    );
    assert_eq!(host.parent_of(tags[0]).unwrap(), Some(host.head().unwrap()));
}

#[tokio::test]
async fn failed_loads_are_evicted_so_a_retry_starts_over() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert("/bad.js", bundle("c", "module.exports = { ok: true };"));
    fetcher.fail_next("/bad.js", "connection reset");

    let err = loader
        .require_ensure(BundleRequest::new("c", "/bad.js"))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Failed { .. }), "{err}");
    assert_eq!(err.module_id(), Some("c"));
    assert_eq!(loader.record_count(), 0);

    let exports = loader
        .require_ensure(BundleRequest::new("c", "/bad.js"))
        .await
        .expect("retry succeeds");
    assert_eq!(exports.get_json("ok").unwrap(), json!(true));
    assert_eq!(fetcher.request_count("/bad.js"), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_loads_time_out_and_release_their_record() {
    let (_host, loader, fetcher) = setup();
    fetcher.hang("/slow.js");

    let started = tokio::time::Instant::now();
    let err = loader
        .require_ensure(BundleRequest::new("slow", "/slow.js"))
        .await
        .unwrap_err();

    match err {
        LoadError::Timeout { id, timeout, .. } => {
            assert_eq!(id, "slow");
            assert_eq!(timeout, Duration::from_secs(120));
        }
        other => panic!("expected a timeout, got {other}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(120));
    assert!(elapsed < Duration::from_secs(121));
    assert_eq!(loader.record_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_text_fetches_share_the_same_ceiling() {
    let (_host, loader, fetcher) = setup();
    fetcher.hang("/slow-text.js");

    let started = tokio::time::Instant::now();
    let err = loader
        .require_ensure(BundleRequest::new("slow-text", "/slow-text.js").text_mode())
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::Timeout { .. }), "{err}");
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert!(!loader.is_pending("slow-text"));
    assert_eq!(loader.record_count(), 0);
}

#[tokio::test]
async fn no_cache_fetches_again() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert(
        "/n.js",
        bundle(
            "n",
            "globalThis.__loads = (globalThis.__loads || 0) + 1; module.exports = { n: globalThis.__loads };",
        ),
    );

    let first = loader
        .require_ensure(BundleRequest::new("n", "/n.js"))
        .await
        .expect("first load");
    let cached = loader
        .require_ensure(BundleRequest::new("n", "/n.js"))
        .await
        .expect("cached load");
    assert!(first.same_value(&cached));
    assert_eq!(fetcher.request_count("/n.js"), 1);

    let fresh = loader
        .require_ensure(BundleRequest::new("n", "/n.js").no_cache())
        .await
        .expect("fresh load");
    assert_eq!(fresh.get_json("n").unwrap(), json!(2));
    assert_eq!(fetcher.request_count("/n.js"), 2);
}

#[tokio::test]
async fn declared_dependencies_are_visible_to_require() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert(
        "/lib.js",
        bundle(
            "lib",
            "module.exports = { greet: function (name) { return 'hi ' + name; } };",
        ),
    );
    fetcher.insert(
        "/app.js",
        bundle(
            "app",
            "var lib = require('shared-lib');\n\
             var config = require('config');\n\
             module.exports = { message: lib.greet(config.user), direct: require('lib') === lib };",
        ),
    );

    let lib = loader
        .require_ensure(BundleRequest::new("lib", "/lib.js"))
        .await
        .expect("lib");
    let app = loader
        .require_ensure(
            BundleRequest::new("app", "/app.js")
                .with_dep("shared-lib", lib.clone())
                .with_dep_value("config", json!({"user": "ada"})),
        )
        .await
        .expect("app");

    assert_eq!(
        app.to_json().unwrap(),
        json!({"message": "hi ada", "direct": true})
    );
    assert_eq!(lib.call("greet", &[json!("bob")]).unwrap(), json!("hi bob"));
}

#[tokio::test]
async fn a_throwing_factory_rejects_and_leaves_nothing_defined() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert("/broken.js", bundle("broken", "require('nope');"));

    let err = loader
        .require_ensure(BundleRequest::new("broken", "/broken.js"))
        .await
        .unwrap_err();

    match err {
        LoadError::Factory { id, message } => {
            assert_eq!(id, "broken");
            assert!(message.contains("module not found: nope"), "{message}");
        }
        other => panic!("expected a factory error, got {other}"),
    }
    assert!(!loader.is_resolved("broken"));
    assert_eq!(loader.record_count(), 0);
    assert!(matches!(
        loader.require("broken"),
        Err(LoadError::NotFound { .. })
    ));
}

#[tokio::test]
async fn a_script_that_never_reaches_the_hook_fails_resolution() {
    let (_host, loader, fetcher) = setup();
    fetcher.insert("/boom.js", "throw new Error('boom before hook');");

    let err = loader
        .require_ensure(BundleRequest::new("boom", "/boom.js"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, LoadError::HookResolution { ref id, .. } if id == "boom"),
        "{err}"
    );
    assert_eq!(loader.record_count(), 0);
}

#[tokio::test]
async fn text_mode_wraps_and_transforms_the_source() {
    let (host, loader, fetcher) = setup();
    fetcher.insert(
        "/text.js",
        "module.exports = { version: '__VERSION__', hasDocument: typeof document.createElement === 'function' };",
    );

    let exports = loader
        .require_ensure(
            BundleRequest::new("text", "/text.js")
                .text_mode()
                .with_transform(|source| source.replace("__VERSION__", "2.1.0")),
        )
        .await
        .expect("text load");

    assert_eq!(
        exports.to_json().unwrap(),
        json!({"version": "2.1.0", "hasDocument": true})
    );
    assert!(host.script_tags("/text.js").is_empty());
}

#[tokio::test]
async fn text_mode_sees_injected_globals() {
    let (host, loader, fetcher) = setup();
    host.inject_global("appConfig", &json!({"region": "eu"}))
        .expect("inject");
    fetcher.insert("/region.js", "module.exports = { region: appConfig.region };");

    let exports = loader
        .require_ensure(BundleRequest::new("region", "/region.js").text_mode())
        .await
        .expect("text load");

    assert_eq!(exports.get_json("region").unwrap(), json!("eu"));
}

#[tokio::test]
async fn injected_exports_are_shared_with_later_bundles() {
    let (host, loader, fetcher) = setup();
    fetcher.insert(
        "/i18n.js",
        bundle("i18n", "module.exports = { t: function (key) { return key.toUpperCase(); } };"),
    );
    fetcher.insert("/page.js", "module.exports = { title: i18n.t('home') };");

    let i18n = loader
        .require_ensure(BundleRequest::new("i18n", "/i18n.js"))
        .await
        .expect("i18n");
    host.inject_exports("i18n", &i18n).expect("inject");

    let page = loader
        .require_ensure(BundleRequest::new("page", "/page.js").text_mode())
        .await
        .expect("page");
    assert_eq!(page.get_json("title").unwrap(), json!("HOME"));
}

#[tokio::test]
async fn text_mode_runs_against_a_context() {
    let (host, loader, fetcher) = setup();
    let context = IsolatedContext::create(&host, ContextOptions::default())
        .await
        .expect("context");
    fetcher.insert(
        "/scoped.js",
        "window.__touched = true; module.exports = { sandboxed: window.__ENCLAVE_CONTEXT__ === true };",
    );

    let exports = loader
        .require_ensure(
            BundleRequest::new("scoped", "/scoped.js")
                .text_mode()
                .with_context(&context),
        )
        .await
        .expect("scoped load");

    assert_eq!(exports.get_json("sandboxed").unwrap(), json!(true));
    let touched: bool = context
        .eval_with("globalThis.__touched === true", "check.js")
        .unwrap();
    assert!(touched);
    let leaked: String = host.eval_with("typeof globalThis.__touched", "check.js").unwrap();
    assert_eq!(leaked, "undefined");
}

#[tokio::test]
async fn resolved_modules_rerun_against_a_new_context() {
    let (host, loader, fetcher) = setup();
    fetcher.insert(
        "/cfg.js",
        bundle(
            "cfg",
            "module.exports = { sandboxed: context.window.__ENCLAVE_CONTEXT__ === true };",
        ),
    );

    let cached = loader
        .require_ensure(BundleRequest::new("cfg", "/cfg.js"))
        .await
        .expect("host load");
    assert_eq!(cached.get_json("sandboxed").unwrap(), json!(false));

    let context = IsolatedContext::create(&host, ContextOptions::default())
        .await
        .expect("context");
    let isolated = loader
        .require_ensure(BundleRequest::new("cfg", "/cfg.js").with_context(&context))
        .await
        .expect("isolated require");

    assert_eq!(isolated.get_json("sandboxed").unwrap(), json!(true));
    assert!(!isolated.same_value(&cached));
    assert!(loader.require("cfg").unwrap().same_value(&cached));
    assert_eq!(fetcher.request_count("/cfg.js"), 1);
}

#[tokio::test]
async fn auxiliary_scripts_run_with_the_context_window_as_this() {
    let (host, loader, fetcher) = setup();
    let context = IsolatedContext::create(&host, ContextOptions::default())
        .await
        .expect("context");
    fetcher.insert(
        "/polyfill.js",
        "__ENCLAVE_GLOBAL_HOOK__('polyfill', function (require, module, exports, scope) {\n\
             this.__polyfilled = scope.window === this;\n\
         }, document.currentScript);",
    );

    loader
        .load_script(BundleRequest::new("polyfill", "/polyfill.js").with_context(&context))
        .await
        .expect("auxiliary script");

    let polyfilled: bool = context
        .eval_with("globalThis.__polyfilled === true", "check.js")
        .unwrap();
    assert!(polyfilled);
    let leaked: String = host
        .eval_with("typeof globalThis.__polyfilled", "check.js")
        .unwrap();
    assert_eq!(leaked, "undefined");
    assert_eq!(loader.record_count(), 0);
    assert!(!loader.is_resolved("polyfill"));
}

#[tokio::test]
async fn relative_urls_resolve_against_the_configured_base() {
    let fetcher = Rc::new(StaticFetcher::new());
    let config = LoaderConfig {
        base_url: "https://console.example.com/app/".to_string(),
        ..LoaderConfig::default()
    };
    let host = HostPage::new(config, fetcher.clone()).expect("host page");
    let loader = ModuleLoader::new(&host).expect("loader");
    fetcher.insert(
        "https://console.example.com/app/bundles/rel.js",
        bundle("rel", "module.exports = 1;"),
    );

    let exports = loader
        .require_ensure(BundleRequest::new("rel", "bundles/rel.js"))
        .await
        .expect("relative load");

    assert_eq!(exports.to_json().unwrap(), json!(1));
}
