use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use common_auth::{ApiEnv, AuthContext};
use common_tasks::{ExponentialBackoff, Looper};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ProductError;

/// Attribute naming the mesh services a product is bound to.
const SERVICES_ATTRIBUTE: &str = "istio-services";

/// Floor for the catalog refresh period.
const MIN_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl QuotaTimeUnit {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "second" => Some(Self::Second),
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }
}

/// An API product, immutable once ingested from the catalog.
#[derive(Debug)]
pub struct Product {
    pub name: String,
    pub display_name: String,
    pub environments: Vec<String>,
    pub resources: Vec<String>,
    pub scopes: Vec<String>,
    pub quota_limit: i64,
    pub quota_interval: i64,
    pub quota_time_unit: Option<QuotaTimeUnit>,
    pub attributes: Vec<Attribute>,
    targets: Vec<String>,
    resource_patterns: Vec<Regex>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Product {
    pub fn has_quota(&self) -> bool {
        self.quota_limit > 0
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Non-empty intersection with the presented scopes; a product without
    /// scopes requires none.
    pub fn is_valid_scopes(&self, scopes: &[String]) -> bool {
        if self.scopes.is_empty() {
            return true;
        }
        self.scopes.iter().any(|scope| scopes.contains(scope))
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.resource_patterns
            .iter()
            .any(|pattern| pattern.is_match(path))
    }
}

/// Compiles a resource glob to an anchored regex.
///
/// `/` alone matches any path; `*` matches within one segment; `**` is only
/// valid as a suffix and matches to end of line.
pub fn compile_resource(resource: &str) -> Result<Regex, ProductError> {
    if resource == "/" {
        return Regex::new(".*").map_err(|_| ProductError::InvalidResource(resource.to_string()));
    }
    if let Some(index) = resource.find("**") {
        if index != resource.len() - 2 {
            return Err(ProductError::InvalidResource(resource.to_string()));
        }
    }

    let (body, to_eol) = match resource.strip_suffix("**") {
        Some(body) => (body, true),
        None => (resource, false),
    };

    let mut pattern = String::from("^");
    for ch in body.chars() {
        if ch == '*' {
            pattern.push_str("[^/]*");
        } else {
            pattern.push_str(&regex::escape(&ch.to_string()));
        }
    }
    if to_eol {
        pattern.push_str(".*");
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|_| ProductError::InvalidResource(resource.to_string()))
}

#[derive(Debug, Deserialize)]
struct ApiProductsResponse {
    #[serde(default, rename = "apiProduct")]
    api_product: Vec<ProductRepr>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductRepr {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    environments: Vec<String>,
    #[serde(default)]
    api_resources: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    quota: NumberRepr,
    #[serde(default)]
    quota_interval: NumberRepr,
    #[serde(default)]
    quota_time_unit: String,
    #[serde(default)]
    attributes: Vec<Attribute>,
}

/// Catalog numbers arrive either as JSON numbers or numeric strings.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    #[default]
    Missing,
    Number(i64),
    Text(String),
}

impl NumberRepr {
    fn parse(&self) -> i64 {
        match self {
            NumberRepr::Missing => 0,
            NumberRepr::Number(value) => *value,
            NumberRepr::Text(text) => text.trim().parse().unwrap_or(0),
        }
    }
}

impl ProductRepr {
    fn ingest(self) -> Result<Product, ProductError> {
        let targets = self
            .attributes
            .iter()
            .find(|attribute| attribute.name == SERVICES_ATTRIBUTE)
            .map(|attribute| {
                attribute
                    .value
                    .split(',')
                    .map(|target| target.trim().to_string())
                    .filter(|target| !target.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let resource_patterns = self
            .api_resources
            .iter()
            .map(|resource| compile_resource(resource))
            .collect::<Result<Vec<_>, _>>()?;

        let scopes = self
            .scopes
            .into_iter()
            .filter(|scope| !scope.trim().is_empty())
            .collect();

        Ok(Product {
            display_name: if self.display_name.is_empty() {
                self.name.clone()
            } else {
                self.display_name
            },
            name: self.name,
            environments: self.environments,
            resources: self.api_resources,
            scopes,
            quota_limit: self.quota.parse(),
            quota_interval: self.quota_interval.parse(),
            quota_time_unit: QuotaTimeUnit::parse(&self.quota_time_unit),
            attributes: self.attributes,
            targets,
            resource_patterns,
        })
    }
}

pub type Catalog = Arc<HashMap<String, Arc<Product>>>;

/// Periodically pulls the product catalog and resolves products for an auth
/// context. The catalog map is replaced atomically; readers never observe a
/// partial update.
#[derive(Clone)]
pub struct ProductManager {
    inner: Arc<ProductInner>,
}

struct ProductInner {
    env: Arc<ApiEnv>,
    catalog: RwLock<Catalog>,
    refresh: Duration,
    poller: Mutex<Option<Looper>>,
}

impl ProductManager {
    pub fn new(env: Arc<ApiEnv>, refresh: Duration) -> Self {
        Self {
            inner: Arc::new(ProductInner {
                env,
                catalog: RwLock::new(Arc::new(HashMap::new())),
                refresh: refresh.max(MIN_REFRESH),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Pulls the catalog once and installs it. Products whose resources fail
    /// to compile are skipped with a warning rather than poisoning the pull.
    pub async fn refresh(&self) -> Result<usize, ProductError> {
        let url = self.inner.env.customer_url("products");
        let response = self
            .inner
            .env
            .authorize(self.inner.env.client().get(&url))
            .send()
            .await
            .map_err(|err| ProductError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProductError::Fetch(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        let body: ApiProductsResponse = response
            .json()
            .await
            .map_err(|err| ProductError::Decode(err.to_string()))?;

        let mut catalog = HashMap::with_capacity(body.api_product.len());
        for repr in body.api_product {
            let name = repr.name.clone();
            match repr.ingest() {
                Ok(product) => {
                    catalog.insert(product.name.clone(), Arc::new(product));
                }
                Err(err) => warn!(product = %name, error = %err, "skipping product"),
            }
        }
        let count = catalog.len();
        debug!(count, "installed product catalog");
        *self.inner.catalog.write().expect("rwlock poisoned") = Arc::new(catalog);
        Ok(count)
    }

    /// Starts the periodic pull. The period was floored at construction.
    pub fn start(&self) {
        let manager = self.clone();
        let looper = Looper::spawn(
            "product-refresh",
            self.inner.refresh,
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(60), 2.0)
                .with_jitter(),
            move |_cancel| {
                let manager = manager.clone();
                async move { manager.refresh().await.map(|_| ()) }
            },
            |_err| Ok(()),
        );
        *self.inner.poller.lock().expect("mutex poisoned") = Some(looper);
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Catalog {
        Arc::clone(&self.inner.catalog.read().expect("rwlock poisoned"))
    }

    /// Products authorizing (service, path) for this context, in the order
    /// of the context's product list. A product bound to the same service
    /// more than once appears once per matching target.
    pub fn resolve(&self, ctx: &AuthContext, service: &str, path: &str) -> Vec<Arc<Product>> {
        let catalog = self.catalog();
        let mut matched = Vec::new();
        for name in &ctx.api_products {
            let Some(product) = catalog.get(name) else {
                continue;
            };
            if !product.is_valid_scopes(&ctx.scopes) {
                continue;
            }
            for target in product.targets() {
                if target == service && product.matches_path(path) {
                    matched.push(Arc::clone(product));
                }
            }
        }
        matched
    }

    pub async fn close(&self) {
        let poller = self.inner.poller.lock().expect("mutex poisoned").take();
        if let Some(poller) = poller {
            poller.close().await;
        }
    }
}
