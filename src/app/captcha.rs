const CAPTCHA_LUMA_THRESHOLD: u8 = 140;
const CAPTCHA_UPSCALE: u32 = 3;

/// Grayscale, binarize at a fixed luminance threshold, then upscale with a
/// smoothing filter. The portal's CAPTCHA glyphs survive hard thresholding
/// much better than the speckled background does.
fn preprocess_captcha(bytes: &[u8]) -> Result<GrayImage, CrawlError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| CrawlError::ImageDecode(err.to_string()))?;
    let mut gray = decoded.to_luma8();
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > CAPTCHA_LUMA_THRESHOLD {
            255
        } else {
            0
        };
    }
    let (width, height) = gray.dimensions();
    Ok(image::imageops::resize(
        &gray,
        width * CAPTCHA_UPSCALE,
        height * CAPTCHA_UPSCALE,
        FilterType::Lanczos3,
    ))
}

/// Recognition seam. The production engine shells out to tesseract; tests
/// script the outputs.
trait CaptchaOcr: Send + Sync {
    fn recognize(&self, image: &Path, profile: &OcrProfile) -> Result<String, CrawlError>;
}

struct TesseractOcr {
    command: String,
}

impl TesseractOcr {
    fn new(command: &str) -> Self {
        TesseractOcr {
            command: command.to_string(),
        }
    }
}

impl CaptchaOcr for TesseractOcr {
    fn recognize(&self, image: &Path, profile: &OcrProfile) -> Result<String, CrawlError> {
        let output = Command::new(&self.command)
            .arg(image)
            .arg("stdout")
            .args(profile.args())
            .output()?;
        if !output.status.success() {
            return Err(CrawlError::Navigation(format!(
                "tesseract ({}) exited with {}",
                profile.name, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// The gating operations the resolver needs from whoever owns the form: fetch
/// the current CAPTCHA bitmap, and submit a transcription (re-asserting any
/// fields the server resets between attempts).
#[async_trait]
trait CaptchaGate: Send {
    async fn fetch_captcha(&mut self) -> Result<Vec<u8>, CrawlError>;
    async fn submit_captcha(&mut self, guess: &str) -> Result<CaptchaVerdict, CrawlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptchaVerdict {
    Accepted,
    Rejected,
}

/// One attempt's worth of evidence; discarded after validation, only the
/// attempt count and the final accepted text outlive the loop.
#[derive(Debug, Clone)]
struct CaptchaAttempt {
    recognized_text: String,
    profile_used: Option<String>,
    accepted: bool,
}

#[derive(Debug, Clone)]
struct CaptchaSolved {
    text: String,
    attempts: usize,
}

/// Runs the OCR-and-submit loop until the server stops flagging the guess.
///
/// The portal's field validation only kicks in from the second submission
/// onward, so the first submission is a counted throwaway: its text goes to
/// the server but its verdict is ignored. A decode failure consumes the
/// attempt without submitting (the image refresh on the next fetch often
/// fixes it). Every attempt's scratch image is removed on exit regardless of
/// outcome.
async fn solve_captcha<G>(
    gate: &mut G,
    ocr: &dyn CaptchaOcr,
    cfg: &CrawlConfig,
) -> Result<CaptchaSolved, CrawlError>
where
    G: CaptchaGate,
{
    let mut attempts = 0usize;
    let mut submissions = 0usize;
    while attempts < cfg.captcha_max_attempts {
        attempts += 1;
        match run_captcha_attempt(gate, ocr, cfg, submissions).await {
            Ok(attempt) => {
                submissions += 1;
                if attempt.accepted {
                    debug!(
                        attempts,
                        profile = attempt.profile_used.as_deref().unwrap_or("none"),
                        "captcha accepted"
                    );
                    return Ok(CaptchaSolved {
                        text: attempt.recognized_text,
                        attempts,
                    });
                }
                debug!(attempt = attempts, "captcha attempt not accepted");
            }
            Err(CrawlError::ImageDecode(reason)) => {
                warn!(attempt = attempts, %reason, "captcha image unreadable, burning the attempt");
            }
            Err(err) => return Err(err),
        }
    }
    Err(CrawlError::CaptchaExhausted { attempts })
}

async fn run_captcha_attempt<G>(
    gate: &mut G,
    ocr: &dyn CaptchaOcr,
    cfg: &CrawlConfig,
    prior_submissions: usize,
) -> Result<CaptchaAttempt, CrawlError>
where
    G: CaptchaGate,
{
    let bytes = gate.fetch_captcha().await?;
    let processed = preprocess_captcha(&bytes)?;

    let mut guess = String::new();
    let mut profile_used = None;
    {
        // Scoped so the scratch file is deleted before we talk to the server.
        let scratch = tempfile::Builder::new()
            .prefix("igr_captcha_")
            .suffix(".png")
            .tempfile_in(&cfg.scratch_dir)?;
        processed
            .save(scratch.path())
            .map_err(|err| CrawlError::ImageDecode(err.to_string()))?;
        for profile in &cfg.ocr_profiles {
            let text = match ocr.recognize(scratch.path(), profile) {
                Ok(text) => text,
                Err(err) => {
                    warn!(profile = %profile.name, %err, "ocr run failed");
                    continue;
                }
            };
            let cleaned = text.trim().to_string();
            if cleaned.len() >= cfg.captcha_expected_len {
                guess = cleaned;
                profile_used = Some(profile.name.clone());
                break;
            }
        }
    }
    if guess.is_empty() {
        debug!("no profile produced a plausible reading, submitting blank guess");
    }

    let verdict = gate.submit_captcha(&guess).await?;
    let accepted =
        prior_submissions > 0 && verdict == CaptchaVerdict::Accepted && !guess.is_empty();
    Ok(CaptchaAttempt {
        recognized_text: guess,
        profile_used,
        accepted,
    })
}

/// Shared across test modules that need a decodable CAPTCHA bitmap.
#[cfg(test)]
fn test_captcha_png() -> Vec<u8> {
    use std::io::Cursor;

    let mut img = GrayImage::from_pixel(30, 12, image::Luma([220u8]));
    for x in 4..26 {
        img.put_pixel(x, 6, image::Luma([20u8]));
    }
    let mut buf = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Baseline config for tests; zero waits, scripted scratch dir.
#[cfg(test)]
fn test_crawl_config(scratch: &Path, captcha_attempts: usize) -> CrawlConfig {
    CrawlConfig {
        base_url: Url::parse("https://portal.test/").unwrap(),
        user_agent: "test".into(),
        concurrency: 1,
        captcha_max_attempts: captcha_attempts,
        captcha_expected_len: 6,
        session_retries: 1,
        job_timeout: Duration::from_secs(60),
        populate_wait: Duration::from_millis(0),
        request_timeout: Duration::from_secs(5),
        page_window: 10,
        advance_failure_limit: 3,
        ocr_profiles: vec![OcrProfile {
            name: "psm7".into(),
            psm: 7,
            oem: 3,
            whitelist: CAPTCHA_WHITELIST.into(),
        }],
        tesseract_cmd: "tesseract".into(),
        scratch_dir: scratch.to_path_buf(),
        debug_dir: None,
    }
}

#[cfg(test)]
mod captcha_tests {
    use super::*;
    use std::sync::Mutex;

    fn tiny_png() -> Vec<u8> {
        test_captcha_png()
    }

    fn test_config(scratch: &Path, max_attempts: usize) -> CrawlConfig {
        test_crawl_config(scratch, max_attempts)
    }

    struct ScriptedOcr {
        outputs: Mutex<VecDeque<&'static str>>,
    }

    impl ScriptedOcr {
        fn new(outputs: &[&'static str]) -> Self {
            ScriptedOcr {
                outputs: Mutex::new(outputs.iter().copied().collect()),
            }
        }
    }

    impl CaptchaOcr for ScriptedOcr {
        fn recognize(&self, _image: &Path, _profile: &OcrProfile) -> Result<String, CrawlError> {
            let mut outputs = self.outputs.lock().unwrap();
            Ok(outputs.pop_front().unwrap_or("").to_string())
        }
    }

    struct ScriptedGate {
        accepted_text: &'static str,
        image: Vec<u8>,
        submitted: Vec<String>,
    }

    impl ScriptedGate {
        fn new(accepted_text: &'static str) -> Self {
            ScriptedGate {
                accepted_text,
                image: tiny_png(),
                submitted: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CaptchaGate for ScriptedGate {
        async fn fetch_captcha(&mut self) -> Result<Vec<u8>, CrawlError> {
            Ok(self.image.clone())
        }

        async fn submit_captcha(&mut self, guess: &str) -> Result<CaptchaVerdict, CrawlError> {
            self.submitted.push(guess.to_string());
            if guess == self.accepted_text {
                Ok(CaptchaVerdict::Accepted)
            } else {
                Ok(CaptchaVerdict::Rejected)
            }
        }
    }

    #[tokio::test]
    async fn accepted_text_and_attempt_count_are_reported() {
        let scratch = tempfile::tempdir().unwrap();
        let cfg = test_config(scratch.path(), 5);
        let ocr = ScriptedOcr::new(&["ZZZZZZ", "BADBAD", "ABC123"]);
        let mut gate = ScriptedGate::new("ABC123");

        let solved = solve_captcha(&mut gate, &ocr, &cfg).await.unwrap();
        assert_eq!(solved.text, "ABC123");
        assert_eq!(solved.attempts, 3);
        assert_eq!(gate.submitted, vec!["ZZZZZZ", "BADBAD", "ABC123"]);
    }

    #[tokio::test]
    async fn first_attempt_success_is_still_a_throwaway() {
        let scratch = tempfile::tempdir().unwrap();
        let cfg = test_config(scratch.path(), 5);
        // The very first read is "correct" but the portal ignores it; the
        // second submission of the same text is the one that counts.
        let ocr = ScriptedOcr::new(&["ABC123", "ABC123"]);
        let mut gate = ScriptedGate::new("ABC123");

        let solved = solve_captcha(&mut gate, &ocr, &cfg).await.unwrap();
        assert_eq!(solved.attempts, 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_leaves_no_artifacts() {
        let scratch = tempfile::tempdir().unwrap();
        let cfg = test_config(scratch.path(), 4);
        let ocr = ScriptedOcr::new(&["WRONG1", "WRONG2", "WRONG3", "WRONG4"]);
        let mut gate = ScriptedGate::new("ABC123");

        let err = solve_captcha(&mut gate, &ocr, &cfg).await.unwrap_err();
        match err {
            CrawlError::CaptchaExhausted { attempts } => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        let leftovers: Vec<_> = fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "scratch images were not cleaned up");
    }

    #[tokio::test]
    async fn short_readings_become_blank_guesses() {
        let scratch = tempfile::tempdir().unwrap();
        let cfg = test_config(scratch.path(), 3);
        let ocr = ScriptedOcr::new(&["AB", "xyz", "ABC123"]);
        let mut gate = ScriptedGate::new("ABC123");

        let solved = solve_captcha(&mut gate, &ocr, &cfg).await.unwrap();
        assert_eq!(solved.attempts, 3);
        assert_eq!(gate.submitted, vec!["", "", "ABC123"]);
    }

    #[tokio::test]
    async fn undecodable_image_burns_the_attempt() {
        let scratch = tempfile::tempdir().unwrap();
        let cfg = test_config(scratch.path(), 3);

        struct FlakyGate {
            inner: ScriptedGate,
            calls: usize,
        }

        #[async_trait]
        impl CaptchaGate for FlakyGate {
            async fn fetch_captcha(&mut self) -> Result<Vec<u8>, CrawlError> {
                self.calls += 1;
                if self.calls == 1 {
                    Ok(b"not an image".to_vec())
                } else {
                    self.inner.fetch_captcha().await
                }
            }

            async fn submit_captcha(&mut self, guess: &str) -> Result<CaptchaVerdict, CrawlError> {
                self.inner.submit_captcha(guess).await
            }
        }

        let ocr = ScriptedOcr::new(&["ABC123", "ABC123"]);
        let mut gate = FlakyGate {
            inner: ScriptedGate::new("ABC123"),
            calls: 0,
        };

        let solved = solve_captcha(&mut gate, &ocr, &cfg).await.unwrap();
        // Attempt 1 died on decode, attempt 2 was the throwaway submission,
        // attempt 3 was accepted.
        assert_eq!(solved.attempts, 3);
        let leftovers: Vec<_> = fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn preprocessing_binarizes_and_upscales() {
        let processed = preprocess_captcha(&tiny_png()).unwrap();
        assert_eq!(processed.dimensions(), (90, 36));
        // Lanczos smoothing blends edges, but the bulk of the image must be
        // hard black or white after thresholding.
        let polarized = processed
            .pixels()
            .filter(|p| p.0[0] < 32 || p.0[0] > 223)
            .count();
        assert!(polarized * 2 > (90 * 36));
    }

    #[test]
    fn garbage_bytes_are_an_image_decode_error() {
        let err = preprocess_captcha(b"definitely not a bitmap").unwrap_err();
        assert!(matches!(err, CrawlError::ImageDecode(_)));
    }
}
