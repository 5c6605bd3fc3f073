use gator::{
    DatasetFetcher, FetchError, FetcherResult, Payload, Record, RepositoryDescriptor, ResolveError,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client;

pub const DATASET_TYPE: &str = "timetable";

const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_DIVISIONS: &[&str] = &["APSC", "ARCLA", "ARTSC", "ERIN", "MUSIC", "SCAR"];

/// Settings for one timetable-builder repository.
#[derive(Debug, Clone, PartialEq)]
pub struct TimetableConfig {
    /// Endpoint that serves pageable courses.
    pub url: String,
    pub sessions: Vec<String>,
    pub divisions: Vec<String>,
    pub page_size: u64,
}

impl TimetableConfig {
    pub fn from_descriptor(descriptor: &RepositoryDescriptor) -> Result<Self, ResolveError> {
        let sessions = descriptor
            .param_str_list("sessions")?
            .filter(|sessions| !sessions.is_empty())
            .ok_or_else(|| {
                ResolveError::invalid_params(descriptor, "`sessions` must list at least one session")
            })?;

        let divisions = descriptor
            .param_str_list("divisions")?
            .unwrap_or_else(|| DEFAULT_DIVISIONS.iter().map(|d| (*d).to_owned()).collect());

        let page_size = match descriptor.param_u64("page_size")? {
            None => DEFAULT_PAGE_SIZE,
            Some(0) => {
                return Err(ResolveError::invalid_params(
                    descriptor,
                    "`page_size` must be greater than zero",
                ));
            }
            Some(n) => n,
        };

        Ok(Self {
            url: descriptor.source.clone(),
            sessions,
            divisions,
            page_size,
        })
    }

    fn request_body(&self, page: u64) -> Payload {
        json!({
            "courseCodeAndTitleProps": {
                "courseCode": "",
                "courseTitle": "",
                "courseSectionCode": "",
                "searchCourseDescription": true
            },
            "departmentProps": [],
            "campuses": [],
            "sessions": self.sessions,
            "requirementProps": [],
            "instructor": "",
            "courseLevels": [],
            "deliveryModes": [],
            "dayPreferences": [],
            "timePreferences": [],
            "divisions": self.divisions,
            "creditWeights": [],
            "page": page,
            "pageSize": self.page_size,
            "direction": "asc"
        })
    }
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    payload: Option<PagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagePayload {
    pageable_course: Option<PageableCourse>,
}

#[derive(Debug, Deserialize)]
struct PageableCourse {
    courses: Option<Vec<Payload>>,
}

/// Pages through a timetable-builder course search.
pub struct TimetableFetcher {
    config: TimetableConfig,
    client: reqwest::Client,
}

impl TimetableFetcher {
    pub fn new(config: TimetableConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn fetch_page(&self, page: u64) -> Result<Vec<Payload>, FetchError> {
        let response = self
            .client
            .post(&self.config.url)
            .header("Accept", "application/json")
            .json(&self.config.request_body(page))
            .send()
            .await
            .map_err(|e| FetchError::Network(format!("page {page}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Network(format!(
                "page {page} returned HTTP {status}: {body}"
            )));
        }

        let parsed: PageResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(format!("page {page}: {e}")))?;

        parsed
            .payload
            .and_then(|payload| payload.pageable_course)
            .and_then(|pageable| pageable.courses)
            .ok_or_else(|| FetchError::Parse(format!("page {page} has no courses array")))
    }
}

/// `{code}-{sectionCode}-{sessions joined by _}`.
fn course_key(course: &Payload) -> Result<String, FetchError> {
    let field = |name: &str| {
        course
            .get(name)
            .and_then(Payload::as_str)
            .ok_or_else(|| FetchError::Parse(format!("course without `{name}`")))
    };

    let sessions = course
        .get("sessions")
        .and_then(Payload::as_array)
        .ok_or_else(|| FetchError::Parse("course without `sessions`".into()))?
        .iter()
        .map(|s| {
            s.as_str()
                .ok_or_else(|| FetchError::Parse("non-string session code".into()))
        })
        .collect::<Result<Vec<_>, _>>()?
        .join("_");

    Ok(format!("{}-{}-{sessions}", field("code")?, field("sectionCode")?))
}

#[async_trait::async_trait]
impl DatasetFetcher for TimetableFetcher {
    fn label(&self) -> &str {
        &self.config.url
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let courses = self.fetch_page(page).await?;
            let count = courses.len();
            debug!(url = %self.config.url, page, courses = count, "fetched timetable page");

            for course in courses {
                records.push(Record::new(course_key(&course)?, course));
            }

            // A short page is the last one.
            if (count as u64) < self.config.page_size {
                break;
            }
            page += 1;
        }

        Ok(records)
    }
}

/// Factory registered under [`DATASET_TYPE`].
pub fn build(descriptor: &RepositoryDescriptor) -> FetcherResult {
    let config = TimetableConfig::from_descriptor(descriptor)?;
    let client = client::http_client(descriptor)?;
    Ok(Box::new(TimetableFetcher::new(config, client)))
}
