use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

use crate::api::ApiOptions;
use crate::error::{Result, WikiError};
use crate::family::Family;
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::site::Site;

pub const TEST_API_URL: &str = "https://test.example.org/w/api.php";

#[derive(Default)]
struct MockState {
    responses: VecDeque<HttpResponse>,
    requests: Vec<HttpRequest>,
}

/// Replays queued responses in order and records every request.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, value: Value) -> &Self {
        self.push_response(200, None, value.to_string())
    }

    pub fn push_response(&self, status: u16, retry_after: Option<u64>, body: String) -> &Self {
        self.state.borrow_mut().responses.push_back(HttpResponse {
            status,
            retry_after,
            body,
        });
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn request(&self, index: usize) -> HttpRequest {
        self.state.borrow().requests[index].clone()
    }

    pub fn remaining(&self) -> usize {
        self.state.borrow().responses.len()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        state.responses.pop_front().ok_or_else(|| {
            WikiError::Unexpected(format!(
                "mock transport has no response for action={:?}",
                request.param("action")
            ))
        })
    }

    fn request_count(&self) -> usize {
        self.state.borrow().requests.len()
    }
}

pub fn quick_options() -> ApiOptions {
    ApiOptions {
        maxlag: None,
        max_retries: 3,
        retry_wait_ms: 0,
        retry_max_wait_ms: 0,
    }
}

/// A site on a single-code test family backed by `transport`.
pub fn mock_site(transport: &MockTransport) -> Site {
    let family = Family::custom("test", TEST_API_URL).expect("test family");
    Site::with_transport(family, "test", Box::new(transport.clone()), quick_options())
        .expect("mock site")
}
