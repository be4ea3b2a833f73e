#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use secret_fs::cache::{ContentCache, ContentError};
use secret_fs::fetch::{CommandSource, FetchError, SecretSource as _};
use secret_fs::fs::secret::{GetAttrError, SecretFs};
use secret_fs::fs::{FileAttr, Fs as _};

use common::shell_source;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invokes_command_with_get_and_path() {
    let source = shell_source(r#"printf '%s %s' "$1" "$2""#);

    let content = source.fetch("/certs/HTTP/server.pem").await.unwrap();

    assert_eq!(&content[..], b"get /certs/HTTP/server.pem");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stdout_is_returned_verbatim() {
    let source = shell_source(r"printf 'line one\nline two\n\000binary'");

    let content = source.fetch("/x").await.unwrap();

    assert_eq!(&content[..], b"line one\nline two\n\0binary");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_output_with_success_is_an_empty_file() {
    let source = shell_source("exit 0");

    let content = source.fetch("/empty").await.unwrap();

    assert!(content.is_empty(), "expected empty content, got {content:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonzero_exit_discards_output() {
    let source = shell_source("printf partial; exit 3");

    let result = source.fetch("/x").await;

    match result {
        Err(FetchError::Exit { status, discarded }) => {
            assert_eq!(status.code(), Some(3));
            assert_eq!(discarded, 7, "the partial output was read, then dropped");
        }
        other => panic!("expected Exit error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_command_is_a_failure() {
    let source = shell_source("printf data; kill -9 $$");

    let result = source.fetch("/x").await;

    match result {
        Err(FetchError::Exit { status, .. }) => {
            assert_eq!(status.code(), None, "terminated by a signal");
        }
        other => panic!("expected Exit error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_command_is_a_spawn_error() {
    let source = CommandSource::new("/nonexistent/secret-command");

    let result = source.fetch("/x").await;

    assert!(
        matches!(result, Err(FetchError::Spawn { .. })),
        "expected Spawn error, got {result:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_output_is_not_capped() {
    // Well past a pipe buffer, to make sure we drain while the child is still writing.
    let source = shell_source("head -c 1048576 /dev/zero");

    let content = source.fetch("/big").await.unwrap();

    assert_eq!(content.len(), 1_048_576);
    assert!(content.iter().all(|b| *b == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_goes_to_the_log_file() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("driver.log");
    let source = shell_source("echo diagnostics >&2; printf content").with_log_file(&log);

    let content = source.fetch("/x").await.unwrap();

    assert_eq!(&content[..], b"content", "stderr must not leak into content");
    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(
        logged.contains("diagnostics"),
        "log should contain the command's stderr, got {logged:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_failure_then_success_through_the_filesystem() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("attempted");
    // Fails the first time (after writing), succeeds afterwards.
    let body = format!(
        r#"if [ -e '{m}' ]; then printf good; else touch '{m}'; printf partial; exit 1; fi"#,
        m = marker.display()
    );
    let fs = SecretFs::new(ContentCache::new(shell_source(&body)));

    let result = fs.getattr("/token").await;
    assert!(
        matches!(
            result,
            Err(GetAttrError::NotFound(ContentError::Fetch(FetchError::Exit { .. })))
        ),
        "first attempt should be not found, got {result:?}"
    );
    assert_eq!(fs.cache().current().await, None, "cache stays empty after failure");

    let attr = fs.getattr("/token").await.unwrap();
    assert!(
        matches!(attr, FileAttr::RegularFile { size: 4, .. }),
        "second attempt should see only the new content, got {attr:?}"
    );
    assert_eq!(&fs.read("/token", 0, 100).await.unwrap()[..], b"good");
}
