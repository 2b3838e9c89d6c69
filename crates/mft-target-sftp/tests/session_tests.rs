//! Scripted packet exchanges against an [`SftpSession`] over a temporary
//! sandbox root. These drive the same dispatch path the SSH channel feeds.

use mft_target_core::{SandboxFs, SandboxRoot};
use mft_target_sftp::SftpSession;
use mft_target_sftp::protocol::{PacketType, StatusCode, pflags};
use std::sync::Arc;
use tempfile::TempDir;

fn session(dir: &TempDir) -> SftpSession {
    SftpSession::new(Arc::new(SandboxFs::new(SandboxRoot::new(dir.path()))))
}

// --- request encoding -----------------------------------------------------

fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut out = (body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&body);
    out
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_handle(out: &mut Vec<u8>, handle: &[u8]) {
    out.extend_from_slice(&(handle.len() as u32).to_be_bytes());
    out.extend_from_slice(handle);
}

fn init_request() -> Vec<u8> {
    let mut body = vec![1u8]; // SSH_FXP_INIT
    body.extend_from_slice(&3u32.to_be_bytes());
    frame(body)
}

fn open_request(id: u32, path: &str, bits: u32) -> Vec<u8> {
    let mut body = vec![PacketType::Open.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, path);
    body.extend_from_slice(&bits.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // empty attrs
    frame(body)
}

fn write_request(id: u32, handle: &[u8], offset: u64, data: &[u8]) -> Vec<u8> {
    let mut body = vec![PacketType::Write.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_handle(&mut body, handle);
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&(data.len() as u32).to_be_bytes());
    body.extend_from_slice(data);
    frame(body)
}

fn read_request(id: u32, handle: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let mut body = vec![PacketType::Read.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_handle(&mut body, handle);
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&len.to_be_bytes());
    frame(body)
}

fn close_request(id: u32, handle: &[u8]) -> Vec<u8> {
    let mut body = vec![PacketType::Close.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_handle(&mut body, handle);
    frame(body)
}

fn path_request(kind: PacketType, id: u32, path: &str) -> Vec<u8> {
    let mut body = vec![kind.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, path);
    frame(body)
}

fn mkdir_request(id: u32, path: &str) -> Vec<u8> {
    let mut body = vec![PacketType::Mkdir.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, path);
    body.extend_from_slice(&0u32.to_be_bytes()); // empty attrs
    frame(body)
}

fn handle_request(kind: PacketType, id: u32, handle: &[u8]) -> Vec<u8> {
    let mut body = vec![kind.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_handle(&mut body, handle);
    frame(body)
}

fn symlink_request(id: u32, link: &str, target: &str) -> Vec<u8> {
    let mut body = vec![PacketType::Symlink.as_u8()];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, link);
    put_string(&mut body, target);
    frame(body)
}

// --- response parsing -----------------------------------------------------

struct Response {
    kind: u8,
    request_id: u32,
    payload: Vec<u8>,
}

fn parse_responses(mut raw: &[u8]) -> Vec<Response> {
    let mut out = Vec::new();
    while !raw.is_empty() {
        let len = u32::from_be_bytes(raw[..4].try_into().unwrap()) as usize;
        let body = &raw[4..4 + len];
        out.push(Response {
            kind: body[0],
            request_id: u32::from_be_bytes(body[1..5].try_into().unwrap()),
            payload: body[5..].to_vec(),
        });
        raw = &raw[4 + len..];
    }
    out
}

fn parse_one(raw: &[u8]) -> Response {
    let mut all = parse_responses(raw);
    assert_eq!(all.len(), 1, "expected exactly one response");
    all.remove(0)
}

fn status_code(resp: &Response) -> u32 {
    assert_eq!(resp.kind, PacketType::Status.as_u8(), "expected STATUS");
    u32::from_be_bytes(resp.payload[..4].try_into().unwrap())
}

fn handle_bytes(resp: &Response) -> Vec<u8> {
    assert_eq!(resp.kind, PacketType::Handle.as_u8(), "expected HANDLE");
    let len = u32::from_be_bytes(resp.payload[..4].try_into().unwrap()) as usize;
    resp.payload[4..4 + len].to_vec()
}

fn data_bytes(resp: &Response) -> Vec<u8> {
    assert_eq!(resp.kind, PacketType::Data.as_u8(), "expected DATA");
    let len = u32::from_be_bytes(resp.payload[..4].try_into().unwrap()) as usize;
    resp.payload[4..4 + len].to_vec()
}

/// Size field out of an ATTRS response (flag word must carry SIZE).
fn attrs_size(resp: &Response) -> u64 {
    assert_eq!(resp.kind, PacketType::Attrs.as_u8(), "expected ATTRS");
    let flags = u32::from_be_bytes(resp.payload[..4].try_into().unwrap());
    assert_ne!(flags & 0x1, 0, "attrs response missing size");
    u64::from_be_bytes(resp.payload[4..12].try_into().unwrap())
}

async fn initialized_session(dir: &TempDir) -> SftpSession {
    let mut sess = session(dir);
    let resp = parse_one(&sess.handle_data(&init_request()).await.unwrap());
    assert_eq!(resp.kind, PacketType::Version.as_u8());
    sess
}

// --- tests ----------------------------------------------------------------

#[tokio::test]
async fn init_negotiates_version_3() {
    let dir = TempDir::new().unwrap();
    let mut sess = session(&dir);

    let raw = sess.handle_data(&init_request()).await.unwrap();
    // VERSION is not id-framed like other responses: byte, then version.
    let len = u32::from_be_bytes(raw[..4].try_into().unwrap()) as usize;
    assert_eq!(len, 5);
    assert_eq!(raw[4], PacketType::Version.as_u8());
    assert_eq!(u32::from_be_bytes(raw[5..9].try_into().unwrap()), 3);
}

#[tokio::test]
async fn requests_before_init_abort_the_session() {
    let dir = TempDir::new().unwrap();
    let mut sess = session(&dir);

    let result = sess
        .handle_data(&path_request(PacketType::Stat, 1, "/x"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn upload_stat_list_scenario() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    // Open /report.txt for creation and write five bytes at offset 0.
    let resp = parse_one(
        &sess
            .handle_data(&open_request(
                1,
                "/report.txt",
                pflags::WRITE | pflags::CREAT | pflags::TRUNC,
            ))
            .await
            .unwrap(),
    );
    let handle = handle_bytes(&resp);

    let resp = parse_one(
        &sess
            .handle_data(&write_request(2, &handle, 0, b"hello"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::Ok as u32);

    let resp = parse_one(&sess.handle_data(&close_request(3, &handle)).await.unwrap());
    assert_eq!(status_code(&resp), StatusCode::Ok as u32);
    assert_eq!(sess.open_handles(), 0);

    // stat reports size 5.
    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Stat, 4, "/report.txt"))
            .await
            .unwrap(),
    );
    assert_eq!(attrs_size(&resp), 5);

    // A listing of / includes report.txt with size 5.
    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Opendir, 5, "/"))
            .await
            .unwrap(),
    );
    let dir_handle = handle_bytes(&resp);

    let resp = parse_one(
        &sess
            .handle_data(&handle_request(PacketType::Readdir, 6, &dir_handle))
            .await
            .unwrap(),
    );
    assert_eq!(resp.kind, PacketType::Name.as_u8());
    let mut payload = &resp.payload[..];
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap());
    assert_eq!(count, 1);
    payload = &payload[4..];
    let name_len = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    let name = std::str::from_utf8(&payload[4..4 + name_len]).unwrap();
    assert_eq!(name, "report.txt");

    // Second READDIR drains to EOF.
    let resp = parse_one(
        &sess
            .handle_data(&handle_request(PacketType::Readdir, 7, &dir_handle))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::Eof as u32);
}

#[tokio::test]
async fn truncating_reopen_discards_previous_content() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&open_request(
                1,
                "/data.bin",
                pflags::WRITE | pflags::CREAT | pflags::TRUNC,
            ))
            .await
            .unwrap(),
    );
    let handle = handle_bytes(&resp);
    sess.handle_data(&write_request(2, &handle, 0, b"a much longer body"))
        .await
        .unwrap();
    sess.handle_data(&close_request(3, &handle)).await.unwrap();

    let resp = parse_one(
        &sess
            .handle_data(&open_request(
                4,
                "/data.bin",
                pflags::READ | pflags::WRITE | pflags::CREAT | pflags::TRUNC,
            ))
            .await
            .unwrap(),
    );
    let handle = handle_bytes(&resp);
    sess.handle_data(&write_request(5, &handle, 0, b"short"))
        .await
        .unwrap();

    let resp = parse_one(
        &sess
            .handle_data(&read_request(6, &handle, 0, 1024))
            .await
            .unwrap(),
    );
    assert_eq!(data_bytes(&resp), b"short");
}

#[tokio::test]
async fn read_past_end_reports_eof() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&open_request(
                1,
                "/empty.bin",
                pflags::WRITE | pflags::READ | pflags::CREAT,
            ))
            .await
            .unwrap(),
    );
    let handle = handle_bytes(&resp);

    let resp = parse_one(
        &sess
            .handle_data(&read_request(2, &handle, 0, 64))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::Eof as u32);
}

#[tokio::test]
async fn traversal_probe_is_denied() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Stat, 1, "/../../etc/passwd"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::PermissionDenied as u32);
}

#[tokio::test]
async fn missing_file_is_no_such_file() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&open_request(1, "/absent.txt", pflags::READ))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::NoSuchFile as u32);
}

#[tokio::test]
async fn mkdir_is_idempotent_and_rmdir_of_gone_dir_fails() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    for id in [1, 2] {
        let resp = parse_one(&sess.handle_data(&mkdir_request(id, "/sub")).await.unwrap());
        assert_eq!(status_code(&resp), StatusCode::Ok as u32);
    }

    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Rmdir, 3, "/sub"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::Ok as u32);

    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Rmdir, 4, "/sub"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::NoSuchFile as u32);
}

#[tokio::test]
async fn symlink_verbs_answer_unsupported() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&symlink_request(1, "/link", "/target"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::OpUnsupported as u32);

    let resp = parse_one(
        &sess
            .handle_data(&path_request(PacketType::Readlink, 2, "/link"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::OpUnsupported as u32);
}

#[tokio::test]
async fn operations_on_stale_handles_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let resp = parse_one(
        &sess
            .handle_data(&open_request(
                1,
                "/f.bin",
                pflags::WRITE | pflags::CREAT,
            ))
            .await
            .unwrap(),
    );
    let handle = handle_bytes(&resp);
    sess.handle_data(&close_request(2, &handle)).await.unwrap();

    let resp = parse_one(
        &sess
            .handle_data(&write_request(3, &handle, 0, b"late"))
            .await
            .unwrap(),
    );
    assert_eq!(status_code(&resp), StatusCode::BadMessage as u32);
}

#[tokio::test]
async fn packets_split_across_data_events_still_dispatch() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let request = path_request(PacketType::Realpath, 9, "a/../b/./c");
    let (first, second) = request.split_at(request.len() / 2);

    assert!(sess.handle_data(first).await.unwrap().is_empty());
    let resp = parse_one(&sess.handle_data(second).await.unwrap());
    assert_eq!(resp.kind, PacketType::Name.as_u8());

    let mut payload = &resp.payload[..];
    let count = u32::from_be_bytes(payload[..4].try_into().unwrap());
    assert_eq!(count, 1);
    payload = &payload[4..];
    let len = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
    assert_eq!(&payload[4..4 + len], b"/b/c");
}

#[tokio::test]
async fn two_packets_in_one_event_yield_two_responses() {
    let dir = TempDir::new().unwrap();
    let mut sess = initialized_session(&dir).await;

    let mut combined = mkdir_request(1, "/one");
    combined.extend_from_slice(&mkdir_request(2, "/two"));

    let raw = sess.handle_data(&combined).await.unwrap();
    let responses = parse_responses(&raw);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].request_id, 1);
    assert_eq!(responses[1].request_id, 2);
    for resp in &responses {
        assert_eq!(status_code(resp), StatusCode::Ok as u32);
    }
}
