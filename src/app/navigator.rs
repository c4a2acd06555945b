const SCRIPT_MANAGER: &str = "ScriptManager1";
const PANEL_MAIN: &str = "UpMain";

// "Rest of Maharashtra" attribute search controls.
const BTN_ENTRY_REST: &str = "btnOtherdistrictSearch";
const FLD_YEAR_ATTR: &str = "ddlFromYear1";
const FLD_DISTRICT_ATTR: &str = "ddlDistrict1";
const FLD_TAHSIL: &str = "ddltahsil";
const FLD_VILLAGE: &str = "ddlvillage";
const FLD_PROPERTY_NO: &str = "txtAttributeValue1";
const FLD_CAPTCHA_ATTR: &str = "txtImg1";
const BTN_SEARCH_ATTR: &str = "btnSearch_RestMaha";

// Document-number search controls.
const LNK_DOCUMENT_TAB: &str = "Document Number";
const FLD_DOC_TYPE: &str = "rblDocType";
const DOC_TYPE_REGULAR: &str = "Regular";
const FLD_DISTRICT_DOC: &str = "ddldistrictfordoc";
const FLD_SRO: &str = "ddlSROName";
const FLD_YEAR_DOC: &str = "ddlYearForDoc";
const FLD_DOC_NO: &str = "txtDocumentNo";
const FLD_CAPTCHA_DOC: &str = "TextBox1";
const BTN_SEARCH_DOC: &str = "btnSearch";

/// The CAPTCHA image has worn several ids across portal revisions.
const CAPTCHA_IMG_SELECTORS: [&str; 3] = ["img#imgCaptcha_new", "img#imgCaptcha1", "img#imgCaptcha"];

const ERROR_LABEL_ID: &str = "#lblMsg";
const ERROR_CLASS: &str = ".error-message";

/// Everything harvested from one search's result grid.
#[derive(Debug, Default)]
struct PageHarvest {
    records: Vec<RegistrationRecord>,
    pages: usize,
    truncated: bool,
}

/// Drives one portal session through the postback protocol: land, open the
/// right search panel, walk the cascading dropdowns, clear the CAPTCHA and
/// page through the grid. Owns the form-field bag and the hidden-token state;
/// all DOM inspection happens in sync helpers over the last rendered HTML so
/// nothing non-`Send` lives across an await.
struct Navigator<T: Transport> {
    cfg: Arc<CrawlConfig>,
    transport: T,
    criteria: SearchCriteria,
    state: NavState,
    session: SessionState,
    form: BTreeMap<String, String>,
    page_html: String,
    captcha_attempts: usize,
}

impl<T: Transport> Navigator<T> {
    fn new(cfg: Arc<CrawlConfig>, transport: T, criteria: SearchCriteria) -> Self {
        Navigator {
            cfg,
            transport,
            criteria,
            state: NavState::Init,
            session: SessionState::default(),
            form: BTreeMap::new(),
            page_html: String::new(),
            captcha_attempts: 0,
        }
    }

    /// Lands on the portal and opens the search panel for the criteria's
    /// variant. Both variants enter through the "Rest of Maharashtra" button;
    /// the document search is one more postback behind it.
    async fn start(&mut self) -> Result<(), CrawlError> {
        debug!(variant = self.criteria.variant_name(), "opening portal session");
        let body = self.transport.get_page(&self.cfg.base_url).await?;
        self.absorb_response(&body)?;
        self.state = NavState::Landed;

        if !element_exists(&self.page_html, &format!("input#{BTN_ENTRY_REST}")) {
            self.state = NavState::Failed;
            return Err(CrawlError::Navigation(
                "search entry control missing on landing page".to_string(),
            ));
        }
        let entry_value = element_attr(&self.page_html, &format!("input#{BTN_ENTRY_REST}"), "value")
            .unwrap_or_else(|| "Rest of Maharashtra".to_string());
        self.postback_button(BTN_ENTRY_REST, &entry_value).await?;

        if let SearchCriteria::Document { .. } = self.criteria {
            let Some((target, argument)) =
                find_postback_link_by_text(&self.page_html, LNK_DOCUMENT_TAB)
            else {
                self.state = NavState::Failed;
                return Err(CrawlError::Navigation(
                    "document-number tab link not found".to_string(),
                ));
            };
            self.postback_link(&target, &argument).await?;
            self.form
                .insert(FLD_DOC_TYPE.to_string(), DOC_TYPE_REGULAR.to_string());
        }
        self.state = NavState::VariantSelected;
        Ok(())
    }

    /// Commits the criteria into the form, parent before child. District and
    /// tahsil selections fire their server-side cascades; the final level of
    /// each variant only needs its value set.
    async fn fill_fields(&mut self) -> Result<(), CrawlError> {
        match self.criteria.clone() {
            SearchCriteria::Attribute {
                year,
                district,
                tahsil,
                village,
                property_number,
            } => {
                self.set_dropdown(FLD_YEAR_ATTR, &year)?;
                self.state = NavState::FieldsFilled(1);
                self.set_dropdown(FLD_DISTRICT_ATTR, &district)?;
                self.cascade(FLD_DISTRICT_ATTR).await?;
                self.state = NavState::FieldsFilled(2);
                self.set_dropdown(FLD_TAHSIL, &tahsil)?;
                self.cascade(FLD_TAHSIL).await?;
                self.state = NavState::FieldsFilled(3);
                self.set_dropdown(FLD_VILLAGE, &village)?;
                self.form
                    .insert(FLD_PROPERTY_NO.to_string(), property_number);
                self.state = NavState::FieldsFilled(4);
            }
            SearchCriteria::Document {
                year,
                district,
                sro_office,
                document_number,
            } => {
                self.set_dropdown(FLD_DISTRICT_DOC, &district)?;
                self.cascade(FLD_DISTRICT_DOC).await?;
                self.state = NavState::FieldsFilled(1);
                self.set_dropdown(FLD_SRO, &sro_office)?;
                self.state = NavState::FieldsFilled(2);
                self.set_dropdown(FLD_YEAR_DOC, &year)?;
                self.form.insert(FLD_DOC_NO.to_string(), document_number);
                self.state = NavState::FieldsFilled(3);
            }
        }
        Ok(())
    }

    /// Runs the CAPTCHA loop against this session and records how many
    /// submissions it took.
    async fn resolve_captcha(&mut self, ocr: &dyn CaptchaOcr) -> Result<(), CrawlError> {
        self.state = NavState::CaptchaGate;
        let cfg = Arc::clone(&self.cfg);
        let solved = solve_captcha(self, ocr, &cfg).await?;
        debug!(attempts = solved.attempts, text = %solved.text, "captcha cleared");
        self.state = NavState::ResultsReady;
        Ok(())
    }

    /// Walks the result grid page by page. Pager labels within a later page
    /// set are relative, so the absolute position is tracked alongside the
    /// set base. Structural errors abort; transient advance failures are
    /// retried, and the count resets after every successful advance. Only a
    /// consecutive run past the limit truncates the harvest.
    async fn collect_results(&mut self) -> Result<PageHarvest, CrawlError> {
        if self.state != NavState::ResultsReady {
            debug!(state = ?self.state, "collecting results before the captcha gate settled");
        }
        let mut harvest = PageHarvest::default();
        let mut current: u32 = 1;
        let mut base: u32 = 0;

        loop {
            let Some(table) = find_results_table(&self.page_html) else {
                debug!("no result grid on page, treating as empty result set");
                break;
            };
            harvest.pages += 1;
            let records = extract_records(&table);
            debug!(page = current, rows = records.len(), "harvested result page");
            harvest.records.extend(records);

            let links = pagination_links(&table);
            let (link, next_current, next_base) =
                match next_page_action(&links, current, base, self.cfg.page_window) {
                    NextPageAction::Stop => break,
                    NextPageAction::Advance { link, page } => (link, page, base),
                    NextPageAction::AdvanceWindow { link, base: new_base } => {
                        (link, new_base + 1, new_base)
                    }
                };

            let mut advanced = false;
            let mut failures = 0usize;
            while failures < self.cfg.advance_failure_limit {
                match self.postback_link(&link.target, &link.argument).await {
                    Ok(()) => {
                        advanced = true;
                        break;
                    }
                    Err(err) if err.retryable() => {
                        failures += 1;
                        warn!(page = next_current, %err, "page advance failed");
                    }
                    Err(err) => return Err(err),
                }
            }
            if !advanced {
                warn!(
                    after_page = current,
                    "advance failure budget exhausted, returning partial result set"
                );
                harvest.truncated = true;
                break;
            }
            current = next_current;
            base = next_base;
        }
        Ok(harvest)
    }

    fn set_dropdown(&mut self, field: &str, wanted: &str) -> Result<(), CrawlError> {
        let options = select_options(&self.page_html, field);
        let value = pick_option(&options, wanted, field)?;
        self.form.insert(field.to_string(), value);
        Ok(())
    }

    /// Fires a dropdown's autopostback and waits out the portal's repopulation
    /// lag before the next selection reads the refreshed options.
    async fn cascade(&mut self, field: &str) -> Result<(), CrawlError> {
        self.postback(field, field, "", None).await?;
        if !self.cfg.populate_wait.is_zero() {
            tokio::time::sleep(self.cfg.populate_wait).await;
        }
        Ok(())
    }

    async fn postback_button(&mut self, name: &str, value: &str) -> Result<(), CrawlError> {
        self.postback(name, "", "", Some((name, value))).await
    }

    async fn postback_link(&mut self, target: &str, argument: &str) -> Result<(), CrawlError> {
        self.postback(target, target, argument, None).await
    }

    /// One MS-AJAX partial postback: script-manager header field, the event
    /// pair, the hidden-token bag, the accumulated form fields and, for
    /// button-sourced posts, the button's own name/value pair.
    async fn postback(
        &mut self,
        trigger: &str,
        event_target: &str,
        event_argument: &str,
        button: Option<(&str, &str)>,
    ) -> Result<(), CrawlError> {
        let mut fields: Vec<(String, String)> = vec![
            (
                SCRIPT_MANAGER.to_string(),
                format!("{PANEL_MAIN}|{trigger}"),
            ),
            ("__EVENTTARGET".to_string(), event_target.to_string()),
            ("__EVENTARGUMENT".to_string(), event_argument.to_string()),
            ("__LASTFOCUS".to_string(), String::new()),
        ];
        let mut tokens = Vec::new();
        self.session.apply_to(&mut tokens);
        for (name, value) in tokens {
            push_unique(&mut fields, &name, &value);
        }
        for (name, value) in &self.form {
            push_unique(&mut fields, name, value);
        }
        if let Some((name, value)) = button {
            push_unique(&mut fields, name, value);
        }
        push_unique(&mut fields, "__ASYNCPOST", "true");

        let body = self
            .transport
            .post_form(&self.cfg.base_url, &fields, true)
            .await?;
        self.absorb_response(&body)
    }

    fn absorb_response(&mut self, body: &str) -> Result<(), CrawlError> {
        let page = parse_portal_response(body)?;
        self.session.absorb(&page)?;
        if !page.html.trim().is_empty() {
            self.page_html = page.html;
        }
        Ok(())
    }
}

/// The navigator is its own CAPTCHA gate: it knows where the image lives and
/// which fields a resubmission must re-assert.
#[async_trait]
impl<T: Transport> CaptchaGate for Navigator<T> {
    async fn fetch_captcha(&mut self) -> Result<Vec<u8>, CrawlError> {
        let Some(src) = select_first_attr(&self.page_html, &CAPTCHA_IMG_SELECTORS, "src") else {
            return Err(CrawlError::Navigation(
                "captcha image not present on search panel".to_string(),
            ));
        };
        let url = self
            .cfg
            .base_url
            .join(&src)
            .map_err(|err| CrawlError::Navigation(format!("bad captcha image url: {err}")))?;
        self.transport.get_bytes(&url).await
    }

    async fn submit_captcha(&mut self, guess: &str) -> Result<CaptchaVerdict, CrawlError> {
        // A rejected submission clears the free-text search field server-side,
        // so it is re-asserted on every pass.
        match self.criteria.clone() {
            SearchCriteria::Attribute {
                property_number, ..
            } => {
                self.form
                    .insert(FLD_PROPERTY_NO.to_string(), property_number);
                self.form
                    .insert(FLD_CAPTCHA_ATTR.to_string(), guess.to_string());
                let value = element_attr(
                    &self.page_html,
                    &format!("input#{BTN_SEARCH_ATTR}"),
                    "value",
                )
                .unwrap_or_else(|| "Search".to_string());
                self.postback_button(BTN_SEARCH_ATTR, &value).await?;
            }
            SearchCriteria::Document {
                document_number, ..
            } => {
                self.form.insert(FLD_DOC_NO.to_string(), document_number);
                self.form
                    .insert(FLD_CAPTCHA_DOC.to_string(), guess.to_string());
                self.postback_button(BTN_SEARCH_DOC, "Search").await?;
            }
        }
        self.captcha_attempts += 1;
        self.state = NavState::Submitted;

        match validation_error(&self.page_html) {
            Some(message) => {
                debug!(%message, "portal flagged the captcha submission");
                Ok(CaptchaVerdict::Rejected)
            }
            None => Ok(CaptchaVerdict::Accepted),
        }
    }
}

fn push_unique(fields: &mut Vec<(String, String)>, name: &str, value: &str) {
    if !fields.iter().any(|(existing, _)| existing == name) {
        fields.push((name.to_string(), value.to_string()));
    }
}

fn element_exists(html: &str, selector: &str) -> bool {
    let doc = Html::parse_document(html);
    Selector::parse(selector)
        .map(|sel| doc.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn element_attr(html: &str, selector: &str, attr: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::to_string)
}

fn select_first_attr(html: &str, selectors: &[&str], attr: &str) -> Option<String> {
    selectors
        .iter()
        .find_map(|selector| element_attr(html, selector, attr))
}

/// Reads a dropdown's options as (value, text) pairs.
fn select_options(html: &str, select_id: &str) -> Vec<(String, String)> {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse(&format!("select#{select_id} option")) else {
        return Vec::new();
    };
    doc.select(&sel)
        .map(|option| {
            let text: String = option.text().collect::<String>().trim().to_string();
            let value = option
                .value()
                .attr("value")
                .map(str::to_string)
                .unwrap_or_else(|| text.clone());
            (value, text)
        })
        .collect()
}

fn is_placeholder_option(value: &str, text: &str) -> bool {
    value.is_empty() || value == "0" || text.starts_with("---") || text.to_lowercase().contains("select")
}

/// Resolves a wanted label against a dropdown's options: exact match on text
/// or value first, then substring, both case-insensitive. A miss is a hard
/// form error since it means the criteria cannot exist on this portal.
fn pick_option(
    options: &[(String, String)],
    wanted: &str,
    field: &str,
) -> Result<String, CrawlError> {
    if options.is_empty() {
        return Err(CrawlError::Form(format!(
            "dropdown {field} has no options to pick from"
        )));
    }
    let wanted_lower = wanted.to_lowercase();
    let candidates: Vec<&(String, String)> = options
        .iter()
        .filter(|(value, text)| !is_placeholder_option(value, text))
        .collect();
    if let Some((value, _)) = candidates.iter().find(|(value, text)| {
        text.eq_ignore_ascii_case(wanted) || value.eq_ignore_ascii_case(wanted)
    }) {
        return Ok(value.clone());
    }
    if let Some((value, _)) = candidates
        .iter()
        .find(|(_, text)| text.to_lowercase().contains(&wanted_lower))
    {
        return Ok(value.clone());
    }
    Err(CrawlError::Form(format!(
        "no option matching '{wanted}' in dropdown {field}"
    )))
}

fn find_postback_link_by_text(html: &str, needle: &str) -> Option<(String, String)> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("a[href]").ok()?;
    for anchor in doc.select(&sel) {
        let text: String = anchor.text().collect();
        if !text.contains(needle) {
            continue;
        }
        if let Some(caps) = anchor
            .value()
            .attr("href")
            .and_then(|href| DO_POSTBACK_RE.captures(href))
        {
            return Some((caps[1].to_string(), caps[2].to_string()));
        }
    }
    None
}

/// Negative-only validation: the portal never confirms a good CAPTCHA, it only
/// complains about a bad one.
fn validation_error(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    if let Ok(sel) = Selector::parse(ERROR_LABEL_ID) {
        for label in doc.select(&sel) {
            let text: String = label.text().collect::<String>().trim().to_string();
            let lower = text.to_lowercase();
            if lower.contains("invalid") || lower.contains("incorrect") || lower.contains("wrong") {
                return Some(text);
            }
        }
    }
    if let Ok(sel) = Selector::parse(ERROR_CLASS) {
        for label in doc.select(&sel) {
            let text: String = label.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}
