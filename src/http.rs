//! HTTP surface (spec.md §6): `PUT /block`, `GET /block/{hash}`,
//! `DELETE /block/{hash}`, and `GET /health`. One task per accepted
//! connection, serialized through hyper's HTTP/1.1 implementation with
//! keep-alive honored by default.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use buddy_proto::{ErrorCode, Reply, Request};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request as HttpRequest, Response, StatusCode};
use tracing::{error, warn};

use crate::payload_io;
use crate::worker::{self, WorkerHandle};

type BoxBody = Full<Bytes>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

pub struct AppState {
    pub handle: WorkerHandle,
    pub data_file: Arc<std::fs::File>,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(body.into()))
        .expect("static response is always valid")
}

fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response is always valid")
}

pub async fn serve(state: Arc<AppState>, req: HttpRequest<Incoming>) -> Result<Response<BoxBody>, Infallible> {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => empty_response(StatusCode::OK),
        (&Method::PUT, "/block") => put_block(state, client_id, req).await,
        (&Method::GET, p) if p.starts_with("/block/") => get_block(state, client_id, &p["/block/".len()..]).await,
        (&Method::DELETE, p) if p.starts_with("/block/") => delete_block(state, client_id, &p["/block/".len()..]).await,
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn parse_hash(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

async fn put_block(state: Arc<AppState>, client_id: u64, req: HttpRequest<Incoming>) -> Response<BoxBody> {
    let content_length = match req.headers().get(hyper::header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok()) {
        Some(len) => len,
        None => return text_response(StatusCode::BAD_REQUEST, "missing Content-Length"),
    };

    if content_length == 0 {
        return text_response(StatusCode::BAD_REQUEST, "empty body");
    }
    if content_length > worker::MAX_PAYLOAD_BYTES {
        return text_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return text_response(StatusCode::BAD_REQUEST, "failed to read body");
        }
    };
    if body.len() as u64 != content_length {
        return text_response(StatusCode::BAD_REQUEST, "body length did not match Content-Length");
    }

    let meta = match worker::reserve_block_for_put(&state.handle, client_id, content_length).await {
        Ok(meta) => meta,
        Err(code) => return error_response(code),
    };

    let offset = worker::offset_of(&meta);
    let digest_hex = match payload_io::write_payload_with_hash(body, Arc::clone(&state.data_file), offset).await {
        Ok(digest) => digest,
        Err(err) => {
            error!(error = %err, "failed to write payload to data file");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let hash = match parse_hash(&digest_hex) {
        Some(hash) => hash,
        None => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    };

    let reply = state
        .handle
        .call(client_id, Some(hash), |header| Request::OccupyBlock {
            header,
            hash,
            class: meta.size_class,
            block_num: meta.block_num,
            data_size: content_length,
        })
        .await;

    match reply {
        Reply::OccupyResult { .. } => text_response(StatusCode::OK, digest_hex),
        Reply::ErrorResult { code, .. } => {
            // occupy_from_temp only fails on block-already-exists, meaning
            // another PUT already holds this hash. There is no allocator
            // operation to release a temp entry that was never occupied
            // (release_block looks up by content hash, which this
            // reservation doesn't have); the block stays in the temp list
            // until the next startup's recover_temp reclaims it.
            warn!(?code, block_num = meta.block_num, class = ?meta.size_class, "reservation orphaned after occupy conflict, pending next recover_temp");
            error_response(code)
        }
        _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

async fn get_block(state: Arc<AppState>, client_id: u64, hash_str: &str) -> Response<BoxBody> {
    let Some(hash) = parse_hash(hash_str) else {
        return text_response(StatusCode::BAD_REQUEST, "malformed hash");
    };

    let reply = state
        .handle
        .call(client_id, Some(hash), |header| Request::GetAddress { header, hash })
        .await;

    match reply {
        Reply::GetAddressResult { offset, data_size, .. } => {
            let mut buf = Vec::with_capacity(data_size as usize);
            if let Err(err) = payload_io::copy_from_file(&mut buf, Arc::clone(&state.data_file), offset, data_size).await {
                error!(error = %err, "failed to read payload from data file");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/octet-stream")
                .header("content-length", data_size)
                .body(Full::new(Bytes::from(buf)))
                .expect("response is always valid")
        }
        Reply::ErrorResult { code, .. } => error_response(code),
        _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

async fn delete_block(state: Arc<AppState>, client_id: u64, hash_str: &str) -> Response<BoxBody> {
    let Some(hash) = parse_hash(hash_str) else {
        return text_response(StatusCode::BAD_REQUEST, "malformed hash");
    };

    let reply = state
        .handle
        .call(client_id, Some(hash), |header| Request::ReleaseBlock { header, hash })
        .await;

    match reply {
        Reply::ReleaseResult { .. } => empty_response(StatusCode::OK),
        Reply::ErrorResult { code, .. } => error_response(code),
        _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

fn error_response(code: ErrorCode) -> Response<BoxBody> {
    match code {
        ErrorCode::BlockNotFound => text_response(StatusCode::NOT_FOUND, "not found"),
        ErrorCode::InvalidSize => text_response(StatusCode::BAD_REQUEST, "invalid size"),
        ErrorCode::BlockAlreadyExists | ErrorCode::AllocationFailed | ErrorCode::Internal => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
