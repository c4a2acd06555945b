const TOKEN_VIEWSTATE: &str = "__VIEWSTATE";
const TOKEN_VIEWSTATE_GENERATOR: &str = "__VIEWSTATEGENERATOR";
const TOKEN_EVENT_VALIDATION: &str = "__EVENTVALIDATION";

/// Tokens the portal requires echoed on every postback. A response that stops
/// carrying one of these means the upstream page shape changed.
const REQUIRED_TOKENS: [&str; 3] = [
    TOKEN_VIEWSTATE,
    TOKEN_VIEWSTATE_GENERATOR,
    TOKEN_EVENT_VALIDATION,
];

/// The hidden-field bag the portal threads through the postback cycle. Renewed
/// from every response, reinjected verbatim into the next request, and never
/// persisted beyond the crawl.
#[derive(Debug, Clone, Default)]
struct SessionState {
    tokens: BTreeMap<String, String>,
}

impl SessionState {
    fn absorb(&mut self, page: &PortalPage) -> Result<(), CrawlError> {
        for (name, value) in &page.tokens {
            self.tokens.insert(name.clone(), value.clone());
        }
        for required in REQUIRED_TOKENS {
            if !page.tokens.contains_key(required) {
                return Err(CrawlError::Protocol(format!(
                    "response omitted expected state token {required}"
                )));
            }
        }
        Ok(())
    }

    fn apply_to(&self, fields: &mut Vec<(String, String)>) {
        for (name, value) in &self.tokens {
            fields.push((name.clone(), value.clone()));
        }
    }

    #[cfg(test)]
    fn token(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }
}

/// A decoded portal response: the renderable HTML (full page, or the
/// concatenated update panels of a partial postback) plus the hidden fields
/// the response carried.
#[derive(Debug, Clone)]
struct PortalPage {
    html: String,
    tokens: BTreeMap<String, String>,
}

fn parse_portal_response(body: &str) -> Result<PortalPage, CrawlError> {
    if looks_like_delta(body) {
        parse_delta(body)
    } else {
        Ok(PortalPage {
            html: body.to_string(),
            tokens: harvest_hidden_fields(body),
        })
    }
}

/// MS-AJAX partial postbacks are pipe-framed: `length|type|id|content|`
/// repeated, where `content` is `length` characters and may itself contain
/// pipes. Full pages never start with a bare decimal run followed by a pipe.
fn looks_like_delta(body: &str) -> bool {
    let mut chars = body.chars();
    let mut saw_digit = false;
    for ch in chars.by_ref() {
        if ch.is_ascii_digit() {
            saw_digit = true;
        } else {
            return saw_digit && ch == '|';
        }
    }
    false
}

fn parse_delta(body: &str) -> Result<PortalPage, CrawlError> {
    let chars: Vec<char> = body.chars().collect();
    let mut pos = 0usize;
    let mut html = String::new();
    let mut tokens = BTreeMap::new();

    while pos < chars.len() {
        // tolerate trailing newlines after the final frame
        if chars[pos..].iter().all(|c| c.is_whitespace()) {
            break;
        }
        let length = delta_field(&chars, &mut pos)?
            .parse::<usize>()
            .map_err(|_| CrawlError::Protocol("malformed delta frame length".to_string()))?;
        let kind = delta_field(&chars, &mut pos)?;
        let id = delta_field(&chars, &mut pos)?;
        if pos + length > chars.len() {
            return Err(CrawlError::Protocol("truncated delta frame".to_string()));
        }
        let content: String = chars[pos..pos + length].iter().collect();
        pos += length;
        if chars.get(pos) == Some(&'|') {
            pos += 1;
        } else {
            return Err(CrawlError::Protocol(
                "delta frame missing terminator".to_string(),
            ));
        }

        match kind.as_str() {
            "updatePanel" => html.push_str(&content),
            "hiddenField" => {
                tokens.insert(id, content);
            }
            _ => {}
        }
    }

    Ok(PortalPage { html, tokens })
}

fn delta_field(chars: &[char], pos: &mut usize) -> Result<String, CrawlError> {
    let start = *pos;
    while *pos < chars.len() && chars[*pos] != '|' {
        *pos += 1;
    }
    if *pos >= chars.len() {
        return Err(CrawlError::Protocol("truncated delta frame".to_string()));
    }
    let field: String = chars[start..*pos].iter().collect();
    *pos += 1;
    Ok(field)
}

fn harvest_hidden_fields(html: &str) -> BTreeMap<String, String> {
    let mut tokens = BTreeMap::new();
    let doc = Html::parse_document(html);
    if let Ok(selector) = Selector::parse("input[type='hidden']") {
        for input in doc.select(&selector) {
            let name = input
                .value()
                .attr("name")
                .or_else(|| input.value().attr("id"));
            if let Some(name) = name {
                let value = input.value().attr("value").unwrap_or_default();
                tokens.insert(name.to_string(), value.to_string());
            }
        }
    }
    tokens
}

/// Wire seam between the navigator and the portal. The production
/// implementation is a cookie-holding reqwest client; tests substitute a
/// scripted portal.
#[async_trait]
trait Transport: Send + Sync {
    async fn get_page(&self, url: &Url) -> Result<String, CrawlError>;
    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, CrawlError>;
    async fn post_form(
        &self,
        url: &Url,
        fields: &[(String, String)],
        ajax: bool,
    ) -> Result<String, CrawlError>;
}

struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    fn new(cfg: &CrawlConfig) -> Result<Self, CrawlError> {
        // The portal's certificate chain is intermittently broken; refusing it
        // outright would make every job fail on bad days.
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_page(&self, url: &Url) -> Result<String, CrawlError> {
        let response = self.client.get(url.clone()).send().await?;
        Ok(response.error_for_status()?.text().await?)
    }

    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, CrawlError> {
        let response = self.client.get(url.clone()).send().await?;
        Ok(response.error_for_status()?.bytes().await?.to_vec())
    }

    async fn post_form(
        &self,
        url: &Url,
        fields: &[(String, String)],
        ajax: bool,
    ) -> Result<String, CrawlError> {
        let mut request = self.client.post(url.clone()).form(fields);
        if ajax {
            request = request
                .header("X-MicrosoftAjax", "Delta=true")
                .header("X-Requested-With", "XMLHttpRequest");
        }
        let response = request.send().await?;
        Ok(response.error_for_status()?.text().await?)
    }
}
