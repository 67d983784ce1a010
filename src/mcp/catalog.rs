//! Capability catalog: the tools, prompts and resources a server offers.

use super::error::CatalogUnavailable;
use super::protocol::parse_response;
use super::transport::{list_fetch_from_response, ListFetch, McpTransport};
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::PaginatedRequestParams;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Upper bound on pages fetched per listing.
pub const MAX_LIST_PAGES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Snapshot taken at connect time or on refresh; replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapabilityCatalog {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
}

impl CapabilityCatalog {
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object"})
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<Tool>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptsPage {
    #[serde(default)]
    prompts: Vec<Prompt>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourcesPage {
    #[serde(default)]
    resources: Vec<Resource>,
    next_cursor: Option<String>,
}

trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ToolsPage {
    type Item = Tool;
    fn into_parts(self) -> (Vec<Tool>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for PromptsPage {
    type Item = Prompt;
    fn into_parts(self) -> (Vec<Prompt>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

impl Page for ResourcesPage {
    type Item = Resource;
    fn into_parts(self) -> (Vec<Resource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

async fn fetch_all<P: Page>(
    transport: &dyn McpTransport,
    request: impl Fn(Option<PaginatedRequestParams>) -> RequestFromClient,
) -> ListFetch<Vec<P::Item>> {
    let mut items = Vec::new();
    let mut cursor = None;

    for _ in 0..MAX_LIST_PAGES {
        let response = transport.send_request(request(paginated_params(cursor))).await;
        match list_fetch_from_response(response, parse_response::<P>) {
            ListFetch::Ok(page) => {
                let (page_items, next_cursor) = page.into_parts();
                items.extend(page_items);
                match next_cursor.filter(|cursor| !cursor.is_empty()) {
                    Some(next) => cursor = Some(next),
                    None => return ListFetch::Ok(items),
                }
            }
            // A later page failing keeps what was already collected.
            ListFetch::MethodNotFound if items.is_empty() => return ListFetch::MethodNotFound,
            ListFetch::Err(err) if items.is_empty() => return ListFetch::Err(err),
            ListFetch::MethodNotFound | ListFetch::Err(_) => return ListFetch::Ok(items),
        }
    }

    debug!("MCP listing stopped after {MAX_LIST_PAGES} pages");
    ListFetch::Ok(items)
}

fn settle<T>(category: &str, fetch: ListFetch<Vec<T>>, errors: &mut Vec<String>) -> Vec<T> {
    match fetch {
        ListFetch::Ok(items) => items,
        ListFetch::MethodNotFound => Vec::new(),
        ListFetch::Err(err) => {
            warn!(category = %category, error = %err, "MCP listing failed");
            errors.push(format!("{category}: {err}"));
            Vec::new()
        }
    }
}

/// Lists all three capability categories concurrently. A category that fails
/// becomes empty; the catalog is unavailable only when every listing was
/// rejected.
pub async fn fetch_catalog(
    transport: &dyn McpTransport,
) -> Result<CapabilityCatalog, CatalogUnavailable> {
    let (tools, prompts, resources) = tokio::join!(
        fetch_all::<ToolsPage>(transport, RequestFromClient::ListToolsRequest),
        fetch_all::<PromptsPage>(transport, RequestFromClient::ListPromptsRequest),
        fetch_all::<ResourcesPage>(transport, RequestFromClient::ListResourcesRequest),
    );

    let mut errors = Vec::new();
    let catalog = CapabilityCatalog {
        tools: settle("tools", tools, &mut errors),
        prompts: settle("prompts", prompts, &mut errors),
        resources: settle("resources", resources, &mut errors),
    };

    if errors.len() == 3 {
        return Err(CatalogUnavailable(format!(
            "Failed to list capabilities ({})",
            errors.join("; ")
        )));
    }
    Ok(catalog)
}
