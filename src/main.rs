//! Stampede-protected caching HTTP proxy
//! =====================================
//!
//! Listens to HTTP GET requests, forwards them to a single upstream server and
//! keeps the successful responses in memory for a configurable Time-to-Live.
//!
//! Concurrent requests for the same uncached path are coalesced through
//! a named lock per cache key: one worker fetches from upstream, the rest
//! wait for it and are served the cached response.

use std::env;
use std::io::Read;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use pico_args::Arguments;

use env_logger::{Builder as LogBuilder, Env as LogEnv};
use log::{debug, error, info, warn};

use httpdate::{fmt_http_date, parse_http_date};
use tiny_http::{Header, Method, Request, Response, Server};
use url::Url;

use stampede_guard::{CacheError, CacheObject, CacheStatus, ObjectCache};

/// Default listen address and port
const LISTEN_ADDRESS: &str = "0.0.0.0:3080";

/// Default upstream server URL
const DEFAULT_UPSTREAM_URL: &str = "http://localhost:8080/";

/// Default cache object Time-to-Live in seconds
const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Limit the cached object size to 16 MiB
const MAX_OBJECT_SIZE: usize = 0x100_0000;

/// HTTP Content-Type of the JSON error responses
const JSON_HTTP_CTYPE: &str = "Content-Type: application/json; charset=utf-8";

/// Program version tag: `"<major>.<minor>.<patch>"`
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HTTP client User Agent string
const HTTP_USER_AGENT: &str = concat!("stampede-guard/", env!("CARGO_PKG_VERSION"));

/// Proxy server configuration
#[derive(Debug, Clone)]
struct ProxyConfig {
    /// Upstream server URL (defaults to [`DEFAULT_UPSTREAM_URL`])
    upstream_url: Url,

    /// Cache object Time-to-Live (defaults to [`DEFAULT_CACHE_TTL_SECS`])
    cache_ttl: Duration,
}

/// Gets the server-global ureq client instance.
///
/// The global agent instance is required to use HTTP request pipelining.
fn ureq_agent() -> ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();

    AGENT
        .get_or_init(|| ureq::builder().user_agent(HTTP_USER_AGENT).build())
        .clone()
}

/// Makes boxed custom ureq status errors for `download_object()`.
fn ureq_status_error(status_code: u16, msg: &str) -> Box<ureq::Error> {
    assert!(status_code >= 400);

    Box::new(ureq::Error::Status(
        status_code,
        ureq::Response::new(status_code, msg, msg).unwrap(),
    ))
}

/// Builds the upstream URL for a proxied request path.
fn upstream_object_url(upstream_url: &Url, path: &str) -> Result<Url, url::ParseError> {
    upstream_url.join(path.trim_start_matches('/'))
}

/// Downloads the response object from the upstream server.
fn download_object(url: &Url) -> Result<CacheObject, Box<ureq::Error>> {
    let response = ureq_agent()
        .request_url("GET", url)
        .call()
        .map_err(Box::new)?;

    let status = response.status();
    let content_type = response.header("Content-Type").map(ToOwned::to_owned);
    let last_modified = response
        .header("Last-Modified")
        .and_then(|s| parse_http_date(s).ok());

    if let Some(content_len) = response.header("Content-Length") {
        let Ok(len) = content_len.parse::<usize>() else {
            return Err(ureq_status_error(502, "Invalid upstream header"));
        };

        if len > MAX_OBJECT_SIZE {
            return Err(ureq_status_error(507, "Insufficient storage"));
        }
    }

    let mut data: Vec<u8> = Vec::new();

    response
        .into_reader()
        .take(MAX_OBJECT_SIZE as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| Box::new(e.into()))?;

    // The object has been truncated by the `take()` limit above.
    if data.len() > MAX_OBJECT_SIZE {
        return Err(ureq_status_error(507, "Insufficient storage"));
    }

    let mut object = CacheObject::new(status, data);

    if let Some(content_type) = content_type {
        object = object.with_content_type(&content_type);
    }
    if let Some(mtime) = last_modified {
        object = object.with_last_modified(mtime);
    }

    Ok(object)
}

/// Logs network errors when sending HTTP responses.
fn log_send_error(error: std::io::Error) {
    error!("proxy: sending response failed: {error}");
    drop(error);
}

/// Sends an empty HTTP error response.
fn send_error_response(request: Request, code: u16) {
    request
        .respond(Response::empty(code))
        .unwrap_or_else(log_send_error);
}

/// Sends a generic JSON-encoded HTTP response.
fn send_json_response(request: Request, code: u16, json: String) {
    let content_type = JSON_HTTP_CTYPE.parse::<Header>().unwrap();

    let response = Response::from_string(json)
        .with_status_code(code)
        .with_header(content_type);

    request.respond(response).unwrap_or_else(log_send_error);
}

/// Escapes text for embedding into a JSON string literal.
#[must_use]
fn escape_json(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => escaped.push(c),
        }
    }

    escaped
}

/// Formats the JSON error response body.
#[must_use]
fn format_json_error(error: impl std::fmt::Display) -> String {
    let detail = escape_json(&error.to_string());
    format!(r#"{{"errors":[{{"detail":"{detail}"}}]}}"#)
}

/// Sends the cached or freshly fetched response object.
fn send_object_response(request: Request, cache_status: CacheStatus, object: CacheObject) {
    let x_cache = Header::from_bytes("X-Cache", cache_status.to_string()).unwrap();
    let age = Header::from_bytes("Age", object.age().as_secs().to_string()).unwrap();

    let mut headers = vec![x_cache, age];

    // Upstream Content-Type is passed through only if it is well-formed.
    if let Some(content_type) = object.content_type() {
        if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
            headers.push(header);
        }
    }

    if let Some(mtime) = object.last_modified() {
        let last_modified = Header::from_bytes("Last-Modified", fmt_http_date(mtime)).unwrap();
        headers.push(last_modified);
    }

    let status = object.status();
    let mut response = Response::from_data(object.into_data()).with_status_code(status);

    for header in headers {
        response = response.with_header(header);
    }

    request.respond(response).unwrap_or_else(log_send_error);
}

/// Sends the HTTP error response from an ureq client error.
fn send_fetch_error_response(request: Request, error: Box<ureq::Error>) {
    match *error {
        // Forward the HTTP error status received from the upstream server.
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_else(format_json_error);
            warn!("fetch: upstream returned HTTP status {code}");
            request
                .respond(Response::from_string(body).with_status_code(code))
                .unwrap_or_else(log_send_error);
        }

        // Return HTTP 502 Bad Gateway for client connection errors.
        ureq::Error::Transport(err) => {
            error!("fetch: connection failed: {err}");
            send_json_response(request, 502, format_json_error(err));
        }
    };
}

/// Processes one HTTP GET request.
///
/// Concurrent requests for the same path share a single upstream fetch.
fn handle_get_request(request: Request, config: &ProxyConfig, cache: &ObjectCache) {
    let path = request.url().to_owned();

    let url = match upstream_object_url(&config.upstream_url, &path) {
        Ok(url) => url,
        Err(err) => {
            warn!("proxy: malformed request path {path}: {err}");
            send_error_response(request, 400);
            return;
        }
    };

    match cache.fetch_with(&path, || download_object(&url)) {
        Ok((status, object)) => {
            match status {
                CacheStatus::Hit | CacheStatus::Coalesced => {
                    debug!("proxy: cache {status} for {path}");
                }
                CacheStatus::Miss => {
                    info!("fetch: downloaded {url} (HTTP {})", object.status());
                }
            }
            send_object_response(request, status, object);
        }
        Err(CacheError::Fetch(err)) => send_fetch_error_response(request, err),
        Err(CacheError::Lock(err)) => {
            error!("proxy: failed to lock cache key {path}: {err}");
            send_error_response(request, 500);
        }
    }
}

/// Builds a printable worker thread name for a request path.
///
/// Request paths may carry raw control bytes, NUL included,
/// which thread names can not hold.
fn worker_thread_name(path: &str) -> String {
    format!("worker-{}", path.escape_debug())
}

/// Starts the thread dropping expired objects from the cache once per TTL.
fn spawn_cache_sweeper(cache: &Arc<ObjectCache>) {
    let cache = Arc::clone(cache);
    // Zero TTL objects are dropped on their next request anyway.
    let period = cache.ttl().max(Duration::from_secs(1));

    std::thread::Builder::new()
        .name("cache-sweeper".to_owned())
        .spawn(move || loop {
            std::thread::sleep(period);
            cache.purge_expired();
        })
        .expect("failed to spawn the cache sweeper thread");
}

/// Hands one HTTP GET request over to a dedicated worker thread.
///
/// Workers may block on the cache key locks for as long as the upstream
/// fetch takes, so the accept loop never processes requests itself.
fn spawn_request_worker(request: Request, config: &ProxyConfig, cache: &Arc<ObjectCache>) {
    let thread_name = worker_thread_name(request.url());

    let config = config.clone();
    let cache = Arc::clone(cache);

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || handle_get_request(request, &config, &cache))
        .expect("failed to spawn the request worker thread");
}

/// Runs HTTP proxy server forever.
fn main_loop(listen_addr: &str, config: &ProxyConfig) -> ! {
    info!("proxy: starting HTTP server at: {listen_addr}");

    let server = Server::http(listen_addr).expect("failed to start the HTTP server");
    let cache = Arc::new(ObjectCache::new(config.cache_ttl));
    spawn_cache_sweeper(&cache);

    // Main HTTP request accept loop.
    loop {
        let request = server.recv().expect("failed to accept new HTTP requests");

        // Only idempotent reads can be cached.
        if *request.method() != Method::Get {
            warn!("proxy: unexpected request method: {}", request.method());
            send_error_response(request, 405);
            continue;
        }

        spawn_request_worker(request, config, &cache);
    }
}

/// Prints the program version banner.
fn version() {
    println!("stampede-guard {VERSION}");
}

/// Prints the program invocation help page.
fn usage() {
    println!("Usage:\n    stampede-guard [options]\n");
    println!("Options:");
    println!("    -v, --verbose              print more debug info");
    println!("    -h, --help                 print help and exit");
    println!("    -V, --version              print version and exit");
    println!("    -L, --listen ADDRESS:PORT  address and port to listen at (0.0.0.0:3080)");
    println!("    -U, --upstream-url URL     upstream server URL (http://localhost:8080/)");
    println!("    -T, --cache-ttl SECONDS    cache object Time-to-Live in seconds (60)");
    println!("\nEnvironment:");
    println!("    STAMPEDE_GUARD_LISTEN        same as --listen option");
    println!("    STAMPEDE_GUARD_UPSTREAM_URL  same as --upstream-url option");
    println!("    STAMPEDE_GUARD_CACHE_TTL     same as --cache-ttl option");
}

fn main() {
    let default_listen_addr =
        env::var("STAMPEDE_GUARD_LISTEN").unwrap_or_else(|_| LISTEN_ADDRESS.to_string());
    let default_upstream_url = env::var("STAMPEDE_GUARD_UPSTREAM_URL")
        .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
    let default_cache_ttl_secs: u64 = env::var("STAMPEDE_GUARD_CACHE_TTL")
        .map_or(DEFAULT_CACHE_TTL_SECS, |s| {
            s.parse().expect("bad STAMPEDE_GUARD_CACHE_TTL value")
        });

    let mut verbose: u32 = 0;
    let mut args = Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        usage();
        return;
    }

    if args.contains(["-V", "--version"]) {
        version();
        return;
    }

    while args.contains(["-v", "--verbose"]) {
        verbose += 1;
    }

    let listen_addr: String = args
        .opt_value_from_str(["-L", "--listen"])
        .expect("bad listen address argument")
        .unwrap_or(default_listen_addr);

    let upstream_url_string: String = args
        .opt_value_from_str(["-U", "--upstream-url"])
        .expect("bad upstream URL argument")
        .unwrap_or(default_upstream_url);

    let cache_ttl_secs: u64 = args
        .opt_value_from_str(["-T", "--cache-ttl"])
        .expect("bad cache TTL argument")
        .unwrap_or(default_cache_ttl_secs);

    let loglevel = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    LogBuilder::from_env(LogEnv::new().default_filter_or(loglevel)).init();

    let upstream_url = Url::parse(&upstream_url_string).expect("invalid upstream URL format");

    info!("proxy: using upstream URL: {upstream_url}");
    info!("cache: using object TTL = {cache_ttl_secs} seconds");

    let config = ProxyConfig {
        upstream_url,
        cache_ttl: Duration::from_secs(cache_ttl_secs),
    };

    // Start the main HTTP server.
    main_loop(&listen_addr, &config)
}
