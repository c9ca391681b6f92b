use serde::{Deserialize, Serialize};

/// A single greeting request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub id: String,
}

impl HelloRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A batch of greeting requests, answered with one [`HelloResponse`] per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequests {
    pub ids: Vec<String>,
}

impl HelloRequests {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub id: String,
    pub value: String,
}
