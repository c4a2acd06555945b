const PORTAL_URL: &str = "https://freesearchigrservice.maharashtra.gov.in/";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "igr-crawler",
    version,
    about = "Headless crawler for the Maharashtra IGR property-registration search"
)]
struct Cli {
    /// Registration year, e.g. 2023. Required unless --jobs is given.
    #[arg(long, value_name = "YEAR")]
    year: Option<String>,

    #[arg(long, value_name = "NAME")]
    district: Option<String>,

    #[arg(long, value_name = "NAME")]
    tahsil: Option<String>,

    #[arg(long, value_name = "NAME")]
    village: Option<String>,

    #[arg(long = "property-number", value_name = "NO")]
    property_number: Option<String>,

    /// SRO office name; switches the crawl to the document-number variant
    /// together with --document-number.
    #[arg(long = "sro", value_name = "NAME")]
    sro_office: Option<String>,

    #[arg(long = "document-number", value_name = "NO")]
    document_number: Option<String>,

    /// JSON file holding an array of search criteria to run as a batch.
    #[arg(long, value_name = "FILE")]
    jobs: Option<String>,

    #[arg(short, long, value_name = "FILE")]
    output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Json)]
    format: FileFormatArg,

    #[arg(long, value_name = "N", default_value_t = 2)]
    concurrency: usize,

    #[arg(long = "captcha-attempts", value_name = "N", default_value_t = 5)]
    captcha_attempts: usize,

    #[arg(long = "session-retries", value_name = "N", default_value_t = 3)]
    session_retries: usize,

    #[arg(long = "job-timeout-secs", value_name = "SECS", default_value_t = 600)]
    job_timeout_secs: u64,

    #[arg(long = "populate-wait-ms", value_name = "MS", default_value_t = 3000)]
    populate_wait_ms: u64,

    #[arg(long = "base-url", value_name = "URL", default_value = PORTAL_URL)]
    base_url: String,

    #[arg(long, value_name = "PATH", default_value = "tesseract")]
    tesseract: String,

    #[arg(long = "user-agent", value_name = "UA")]
    user_agent: Option<String>,

    /// Directory for transient CAPTCHA images; defaults to the system temp dir.
    #[arg(long = "scratch-dir", value_name = "DIR")]
    scratch_dir: Option<String>,

    /// Directory for best-effort failure snapshots of the rendered page.
    #[arg(long = "debug-dir", value_name = "DIR")]
    debug_dir: Option<String>,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
enum FileFormatArg {
    Json,
    Csv,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DataFormat {
    Json,
    Csv,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Json => DataFormat::Json,
            FileFormatArg::Csv => DataFormat::Csv,
        }
    }
}

/// One parameter set for the portal's search workflow. Exactly one of the two
/// known sub-variants; dependent fields (tahsil, village, sro_office) only
/// become selectable after their parent's options have been reloaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SearchCriteria {
    Attribute {
        year: String,
        district: String,
        tahsil: String,
        village: String,
        property_number: String,
    },
    Document {
        year: String,
        district: String,
        sro_office: String,
        document_number: String,
    },
}

impl SearchCriteria {
    fn label(&self) -> String {
        match self {
            SearchCriteria::Attribute {
                year,
                district,
                tahsil,
                village,
                property_number,
            } => format!("{district}/{tahsil}/{village} #{property_number} ({year})"),
            SearchCriteria::Document {
                year,
                district,
                sro_office,
                document_number,
            } => format!("{district}/{sro_office} doc#{document_number} ({year})"),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            SearchCriteria::Attribute { .. } => "attribute",
            SearchCriteria::Document { .. } => "document",
        }
    }
}

/// A single row of the portal's results grid, keyed off the header labels.
/// Seller/purchaser columns hold brace-delimited multi-value lists on the
/// portal side and are always arrays here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct RegistrationRecord {
    doc_no: String,
    doc_name: String,
    registration_date: String,
    sro_name: String,
    sro_code: String,
    property_description: String,
    status: String,
    seller_names: Vec<String>,
    purchaser_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CrawlStatus {
    Success,
    PartialFailure,
    Failure,
}

impl CrawlStatus {
    fn label(self) -> &'static str {
        match self {
            CrawlStatus::Success => "success",
            CrawlStatus::PartialFailure => "partial_failure",
            CrawlStatus::Failure => "failure",
        }
    }
}

/// Terminal outcome of one crawl job. The driver never raises past its
/// boundary; failures are carried in `status`/`error_detail`.
#[derive(Debug, Clone, Serialize)]
struct CrawlResult {
    criteria: SearchCriteria,
    status: CrawlStatus,
    record_count: usize,
    page_count: usize,
    captcha_attempts: usize,
    error_detail: Option<String>,
    records: Vec<RegistrationRecord>,
}

impl CrawlResult {
    fn failure(criteria: SearchCriteria, err: &CrawlError) -> Self {
        let captcha_attempts = match err {
            CrawlError::CaptchaExhausted { attempts } => *attempts,
            _ => 0,
        };
        CrawlResult {
            criteria,
            status: CrawlStatus::Failure,
            record_count: 0,
            page_count: 0,
            captcha_attempts,
            error_detail: Some(format!("{}: {err}", err.kind())),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
enum CrawlError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("invalid form selection: {0}")]
    Form(String),

    #[error("portal protocol drift: {0}")]
    Protocol(String),

    #[error("captcha rejected across {attempts} attempts")]
    CaptchaExhausted { attempts: usize },

    #[error("captcha image unusable: {0}")]
    ImageDecode(String),

    #[error("job exceeded wall-clock budget of {0}s")]
    Timeout(u64),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CrawlError {
    /// Whether a fresh session has a chance of succeeding. Structural
    /// mismatches (`Form`, `Protocol`) and the wall-clock budget are final.
    fn retryable(&self) -> bool {
        match self {
            CrawlError::Navigation(_)
            | CrawlError::CaptchaExhausted { .. }
            | CrawlError::ImageDecode(_)
            | CrawlError::Http(_)
            | CrawlError::Io(_) => true,
            CrawlError::Form(_) | CrawlError::Protocol(_) | CrawlError::Timeout(_) => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CrawlError::Navigation(_) => "navigation_error",
            CrawlError::Form(_) => "form_error",
            CrawlError::Protocol(_) => "protocol_error",
            CrawlError::CaptchaExhausted { .. } => "captcha_exhausted",
            CrawlError::ImageDecode(_) => "image_decode_error",
            CrawlError::Timeout(_) => "timeout_error",
            CrawlError::Http(_) => "http_error",
            CrawlError::Io(_) => "io_error",
        }
    }
}

/// One tesseract invocation shape. The profiles differ in page-segmentation
/// mode because the portal's CAPTCHA renders either as a single text line or
/// as loose characters depending on the distortion draw.
#[derive(Debug, Clone)]
struct OcrProfile {
    name: String,
    psm: u8,
    oem: u8,
    whitelist: String,
}

impl OcrProfile {
    fn args(&self) -> Vec<String> {
        vec![
            "--psm".to_string(),
            self.psm.to_string(),
            "--oem".to_string(),
            self.oem.to_string(),
            "-c".to_string(),
            format!("tessedit_char_whitelist={}", self.whitelist),
        ]
    }
}

const CAPTCHA_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn default_ocr_profiles() -> Vec<OcrProfile> {
    [7u8, 8, 13]
        .into_iter()
        .map(|psm| OcrProfile {
            name: format!("psm{psm}"),
            psm,
            oem: 3,
            whitelist: CAPTCHA_WHITELIST.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
struct CrawlConfig {
    base_url: Url,
    user_agent: String,
    concurrency: usize,
    captcha_max_attempts: usize,
    captcha_expected_len: usize,
    session_retries: usize,
    job_timeout: Duration,
    populate_wait: Duration,
    request_timeout: Duration,
    page_window: u32,
    advance_failure_limit: usize,
    ocr_profiles: Vec<OcrProfile>,
    tesseract_cmd: String,
    scratch_dir: PathBuf,
    debug_dir: Option<PathBuf>,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36";

impl CrawlConfig {
    fn from_cli(cli: &Cli) -> Result<Self, CrawlError> {
        let base_url = Url::parse(&cli.base_url)
            .map_err(|err| CrawlError::Navigation(format!("invalid base URL: {err}")))?;
        Ok(CrawlConfig {
            base_url,
            user_agent: cli
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            concurrency: cli.concurrency.max(1),
            captcha_max_attempts: cli.captcha_attempts.max(2),
            captcha_expected_len: 6,
            session_retries: cli.session_retries.max(1),
            job_timeout: Duration::from_secs(cli.job_timeout_secs.max(1)),
            populate_wait: Duration::from_millis(cli.populate_wait_ms),
            request_timeout: Duration::from_secs(30),
            page_window: 10,
            advance_failure_limit: 3,
            ocr_profiles: default_ocr_profiles(),
            tesseract_cmd: cli.tesseract.clone(),
            scratch_dir: cli
                .scratch_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            debug_dir: cli.debug_dir.as_ref().map(PathBuf::from),
        })
    }
}

#[derive(Debug)]
enum JobEvent {
    Status(String),
    Completed(Box<CrawlResult>),
    Error(String),
    Finished,
}

/// Navigator phases. `FieldsFilled(k)` tracks how many cascading dropdown
/// levels have been committed; changing a parent invalidates everything below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NavState {
    Init,
    Landed,
    VariantSelected,
    FieldsFilled(u8),
    CaptchaGate,
    Submitted,
    ResultsReady,
    Failed,
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn criteria_serde_is_tagged_by_kind() {
        let criteria = SearchCriteria::Attribute {
            year: "2023".into(),
            district: "Pune".into(),
            tahsil: "Haveli".into(),
            village: "X".into(),
            property_number: "15".into(),
        };
        let json = serde_json::to_value(&criteria).unwrap();
        assert_eq!(json["kind"], "attribute");
        assert_eq!(json["property_number"], "15");
        let back: SearchCriteria = serde_json::from_value(json).unwrap();
        assert_eq!(back, criteria);
    }

    #[test]
    fn structural_errors_are_not_retryable() {
        assert!(!CrawlError::Form("bad index".into()).retryable());
        assert!(!CrawlError::Protocol("missing token".into()).retryable());
        assert!(!CrawlError::Timeout(600).retryable());
        assert!(CrawlError::Navigation("no entry control".into()).retryable());
        assert!(CrawlError::CaptchaExhausted { attempts: 5 }.retryable());
    }

    #[test]
    fn failed_results_keep_the_captcha_attempt_count() {
        let criteria = SearchCriteria::Document {
            year: "2022".into(),
            district: "Pune".into(),
            sro_office: "Haveli 3".into(),
            document_number: "4521".into(),
        };
        let result =
            CrawlResult::failure(criteria.clone(), &CrawlError::CaptchaExhausted { attempts: 4 });
        assert_eq!(result.captcha_attempts, 4);
        assert!(
            result
                .error_detail
                .as_deref()
                .unwrap()
                .starts_with("captcha_exhausted")
        );

        let result = CrawlResult::failure(criteria, &CrawlError::Form("bad index".into()));
        assert_eq!(result.captcha_attempts, 0);
    }

    #[test]
    fn default_profiles_cover_line_word_and_raw_modes() {
        let profiles = default_ocr_profiles();
        assert_eq!(
            profiles.iter().map(|p| p.psm).collect::<Vec<_>>(),
            vec![7, 8, 13]
        );
        let args = profiles[0].args();
        assert!(args.contains(&"--psm".to_string()));
        assert!(
            args.iter()
                .any(|a| a.starts_with("tessedit_char_whitelist="))
        );
    }
}
