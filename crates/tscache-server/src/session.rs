use std::sync::Arc;

use crate::protocol::{Request, Response};
use crate::store::MemoryCache;

pub struct Session {
    cache: Arc<MemoryCache>,
}

impl Session {
    pub fn new(cache: Arc<MemoryCache>) -> Self {
        Self { cache }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Set {
                key,
                start,
                end,
                table_count,
                payload,
            } => {
                if start > end {
                    return Response::ClientError(format!("window {start}..{end} is empty"));
                }
                tracing::debug!(key = %key, start, end, bytes = payload.len(), "set");
                self.cache.set(&key, start, end, table_count, payload);
                Response::Stored
            }
            Request::Get { key, start, end } => {
                let payload = self.cache.get(&key, start, end);
                tracing::debug!(key = %key, start, end, bytes = payload.len(), "get");
                Response::Values(payload)
            }
            Request::Delete { key } => {
                if self.cache.delete(&key) {
                    Response::Deleted
                } else {
                    Response::NotFound
                }
            }
        }
    }
}
