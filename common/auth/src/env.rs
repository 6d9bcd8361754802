use reqwest::{Client, RequestBuilder};

/// Request-scoped handle to the backend environment: organization and
/// environment names, base URLs, provisioning credentials, and the shared
/// HTTP client. Contexts compose this handle; nothing is inherited.
#[derive(Clone)]
pub struct ApiEnv {
    org: String,
    env: String,
    apigee_base: String,
    customer_base: String,
    key: String,
    secret: String,
    client: Client,
}

impl ApiEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org: impl Into<String>,
        env: impl Into<String>,
        apigee_base: impl Into<String>,
        customer_base: impl Into<String>,
        key: impl Into<String>,
        secret: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            org: org.into(),
            env: env.into(),
            apigee_base: trim_slash(apigee_base.into()),
            customer_base: trim_slash(customer_base.into()),
            key: key.into(),
            secret: secret.into(),
            client,
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    /// Tenant identifier owning this environment's analytics stream.
    pub fn tenant(&self) -> String {
        format!("{}~{}", self.org, self.env)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn customer_url(&self, path: &str) -> String {
        format!("{}/{}", self.customer_base, path.trim_start_matches('/'))
    }

    pub fn apigee_url(&self, path: &str) -> String {
        format!("{}/{}", self.apigee_base, path.trim_start_matches('/'))
    }

    /// Applies the provisioning basic-auth credentials.
    pub fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.key, Some(&self.secret))
    }
}

fn trim_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
