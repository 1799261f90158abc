use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use http::{HeaderValue, Method};

use super::scenario::*;
use crate::client::{Config, Hooks, RequestOptions};
use crate::request::RequestHead;
use crate::{Error, Response};

#[tokio::test]
async fn follow_moved_permanently() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 301 Moved Permanently\r\nLocation: http://host.test/new\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write(OK),
    ]);

    let client = mock.client(Config::default());
    let res = client.get("http://host.test/old").await.unwrap();

    assert_eq!(res.status, 200);
    assert_eq!(res.request.uri, "http://host.test/new");
    assert_eq!(res.redirect_count(), 1);

    let prev = res.previous.as_ref().unwrap();
    assert_eq!(prev.status, 301);
    assert_eq!(prev.request.uri, "http://host.test/old");
    assert!(prev.previous.is_none());

    assert_eq!(mock.request_lines(), ["GET /old HTTP/1.1", "GET /new HTTP/1.1"]);
}

#[tokio::test]
async fn redirect_body_is_discarded() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 5\r\n\r\nmoved"),
        Read,
        Write(OK),
    ]);

    let client = mock.client(Config::default());
    let res = client.get("http://host.test:8080/a").await.unwrap();

    assert_eq!(res.text(), "ok");
    assert!(res.previous.as_ref().unwrap().body.is_empty());
    assert_eq!(res.request.uri, "http://host.test:8080/b");
    assert_eq!(mock.connects(), 1);
}

#[tokio::test]
async fn redirect_chain() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: /2\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write("HTTP/1.1 303 See Other\r\nLocation: /3\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write(OK),
    ]);

    let client = mock.client(Config::default());
    let res = client.get("http://host.test/1").await.unwrap();

    assert_eq!(res.redirect_count(), 2);
    let p1 = res.previous.as_ref().unwrap();
    assert_eq!(p1.status, 303);
    assert_eq!(p1.previous.as_ref().unwrap().status, 302);
}

#[tokio::test]
async fn max_redirects_returns_redirect() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: /2\r\nContent-Length: 4\r\n\r\nhere"),
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: /3\r\nContent-Length: 4\r\n\r\nhere"),
    ]);

    let client = mock.client(Config::default().with_max_redirects(1));
    let res = client.get("http://host.test/1").await.unwrap();

    assert_eq!(res.status, 302);
    // Not followed, so the body is kept.
    assert_eq!(res.text(), "here");
    assert_eq!(res.redirect_count(), 1);
    assert_eq!(mock.requests().len(), 2);
}

#[tokio::test]
async fn unrecognised_location() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: elsewhere\r\nContent-Length: 0\r\n\r\n"),
    ]);

    let client = mock.client(Config::default());
    let err = client.get("http://host.test/").await.unwrap_err();

    assert_eq!(err.to_string(), "Unrecognised Location: elsewhere");
}

#[tokio::test]
async fn missing_location() {
    let mock = MockConnector::new();
    mock.script(vec![Read, Write("HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n")]);

    let client = mock.client(Config::default());
    let err = client.get("http://host.test/").await.unwrap_err();

    assert!(matches!(err, Error::NoLocationHeader));
}

#[tokio::test]
async fn redirect_to_other_host() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 307 Temporary Redirect\r\nLocation: http://other.test/x\r\nContent-Length: 0\r\n\r\n"),
    ]);
    mock.script(vec![Read, Write(OK)]);

    let client = mock.client(Config::default());
    let req = http::Request::get("http://host.test/")
        .header("authorization", "Bearer abc")
        .body(crate::Body::Empty)
        .unwrap();
    client.request(req).await.unwrap();

    let targets = mock.targets();
    assert_eq!(targets[1].host, "other.test");

    let reqs = mock.requests();
    assert!(reqs[0].1.contains("authorization: Bearer abc"));
    assert!(reqs[1].1.contains("host: other.test\r\n"));
    assert!(!reqs[1].1.contains("authorization"));
}

#[tokio::test]
async fn explicit_target_not_kept_across_redirect() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: http://other.test/x\r\nContent-Length: 0\r\n\r\n"),
    ]);
    mock.script(vec![Read, Write(OK)]);

    let client = mock.client(Config::default());
    let opts = RequestOptions::new().with_target("10.0.0.1", 8080, false);
    let res = client.request_with(get("http://host.test/"), opts).await.unwrap();

    assert_eq!(res.status, 200);

    let targets = mock.targets();
    assert_eq!(targets.len(), 2);
    assert_eq!((targets[0].host.as_str(), targets[0].port), ("10.0.0.1", 8080));
    assert_eq!((targets[1].host.as_str(), targets[1].port), ("other.test", 80));

    let reqs = mock.requests();
    assert_eq!(reqs[1].0, 1);
    assert!(reqs[1].1.starts_with("GET /x HTTP/1.1\r\n"));
    assert!(reqs[1].1.contains("host: other.test\r\n"));
}

#[tokio::test]
async fn post_see_other_becomes_get() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        ReadBody(5),
        Write("HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write(OK),
    ]);

    let client = mock.client(Config::default());
    let res = client.request(post("http://host.test/form", "hello")).await.unwrap();

    assert_eq!(res.request.method, Method::GET);

    let reqs = mock.requests();
    assert!(reqs[0].1.ends_with("hello"));
    assert!(reqs[1].1.starts_with("GET /done HTTP/1.1\r\n"));
    assert!(!reqs[1].1.contains("content-length"));
}

#[tokio::test]
async fn post_temporary_redirect_not_followed() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        ReadBody(5),
        Write("HTTP/1.1 307 Temporary Redirect\r\nLocation: /again\r\nContent-Length: 0\r\n\r\n"),
    ]);

    let client = mock.client(Config::default());
    let res = client.request(post("http://host.test/form", "hello")).await.unwrap();

    assert_eq!(res.status, 307);
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn on_redirect_callback() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 301 Moved Permanently\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write(OK),
    ]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();

    let opts = RequestOptions::new().with_on_redirect(move |res, uri| {
        seen2.lock().unwrap().push((res.status.as_u16(), uri.to_string()));
    });

    let client = mock.client(Config::default());
    client.request_with(get("http://host.test/old"), opts).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), [(301, "http://host.test/new".to_string())]);
}

#[derive(Default)]
struct Jar {
    prepared: AtomicUsize,
    processed: AtomicUsize,
}

impl Hooks for Arc<Jar> {
    fn prepare_request(&self, head: &mut RequestHead) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        head.headers.insert("cookie", HeaderValue::from_static("session=1"));
    }

    fn process_response(&self, _response: &Response) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn hooks_run_per_request_and_final_response() {
    let mock = MockConnector::new();
    mock.script(vec![
        Read,
        Write("HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n"),
        Read,
        Write(OK),
    ]);

    let jar = Arc::new(Jar::default());
    let client = mock.client(Config::default()).with_hooks(jar.clone());
    client.get("http://host.test/a").await.unwrap();

    assert_eq!(jar.prepared.load(Ordering::SeqCst), 2);
    assert_eq!(jar.processed.load(Ordering::SeqCst), 1);

    for (_, r) in mock.requests() {
        assert!(r.contains("cookie: session=1\r\n"));
    }
}
