//! School resource endpoints
//!
//! Every resource follows the same REST shape under the API base, so the
//! helpers here only differ by path.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::{ApiClient, ApiError};

/// A collection exposed by the campus API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Students,
    Parents,
    Teachers,
    Classes,
    Enrollments,
    Grades,
    Attendance,
    Invoices,
    Payments,
    Fees,
    Announcements,
    Messages,
    Terms,
}

impl Resource {
    pub const ALL: [Resource; 13] = [
        Resource::Students,
        Resource::Parents,
        Resource::Teachers,
        Resource::Classes,
        Resource::Enrollments,
        Resource::Grades,
        Resource::Attendance,
        Resource::Invoices,
        Resource::Payments,
        Resource::Fees,
        Resource::Announcements,
        Resource::Messages,
        Resource::Terms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Resource::Students => "students",
            Resource::Parents => "parents",
            Resource::Teachers => "teachers",
            Resource::Classes => "classes",
            Resource::Enrollments => "enrollments",
            Resource::Grades => "grades",
            Resource::Attendance => "attendance",
            Resource::Invoices => "invoices",
            Resource::Payments => "payments",
            Resource::Fees => "fees",
            Resource::Announcements => "announcements",
            Resource::Messages => "messages",
            Resource::Terms => "terms",
        }
    }

    pub fn collection_path(self) -> String {
        format!("/{}", self.name())
    }

    pub fn item_path(self, id: &str) -> String {
        // form encoding turns spaces into '+', which a path would keep literally
        let id: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
        format!("/{}/{}", self.name(), id.replace('+', "%20"))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Resource::ALL
            .into_iter()
            .find(|r| r.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = Resource::ALL.iter().map(|r| r.name()).collect();
                format!("unknown resource '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// CRUD helpers for one resource.
pub struct Resources<'a> {
    client: &'a ApiClient,
    resource: Resource,
}

impl ApiClient {
    pub fn resource(&self, resource: Resource) -> Resources<'_> {
        Resources {
            client: self,
            resource,
        }
    }
}

impl Resources<'_> {
    pub async fn list(&self, filters: &[(&str, &str)]) -> Result<Value, ApiError> {
        self.client
            .get_with_query(&self.resource.collection_path(), filters)
            .await
    }

    pub async fn fetch(&self, id: &str) -> Result<Value, ApiError> {
        self.client.get(&self.resource.item_path(id)).await
    }

    pub async fn create(&self, body: &Value) -> Result<Value, ApiError> {
        self.client
            .post(&self.resource.collection_path(), body)
            .await
    }

    pub async fn update(&self, id: &str, body: &Value) -> Result<Value, ApiError> {
        self.client.put(&self.resource.item_path(id), body).await
    }

    pub async fn remove(&self, id: &str) -> Result<Value, ApiError> {
        self.client.delete(&self.resource.item_path(id)).await
    }
}
