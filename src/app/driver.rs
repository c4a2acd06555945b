const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(1500);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

fn backoff_delay(attempt: usize) -> Duration {
    let exp = attempt.saturating_sub(2).min(16) as u32;
    RETRY_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exp))
        .min(RETRY_BACKOFF_CAP)
}

/// One full portal session for one criteria set. On failure the last rendered
/// page is snapshotted (best effort) before the error propagates to the retry
/// layer.
async fn run_session<T: Transport>(
    cfg: Arc<CrawlConfig>,
    transport: T,
    ocr: &dyn CaptchaOcr,
    criteria: SearchCriteria,
) -> Result<CrawlResult, CrawlError> {
    let mut nav = Navigator::new(Arc::clone(&cfg), transport, criteria.clone());
    match drive_session(&mut nav, ocr).await {
        Ok(harvest) => {
            let truncated = harvest.truncated;
            Ok(CrawlResult {
                criteria,
                status: if truncated {
                    CrawlStatus::PartialFailure
                } else {
                    CrawlStatus::Success
                },
                record_count: harvest.records.len(),
                page_count: harvest.pages,
                captcha_attempts: nav.captcha_attempts,
                error_detail: truncated
                    .then(|| "result set truncated by page-advance failures".to_string()),
                records: harvest.records,
            })
        }
        Err(err) => {
            write_debug_snapshot(&cfg, &nav.page_html);
            Err(err)
        }
    }
}

async fn drive_session<T: Transport>(
    nav: &mut Navigator<T>,
    ocr: &dyn CaptchaOcr,
) -> Result<PageHarvest, CrawlError> {
    nav.start().await?;
    nav.fill_fields().await?;
    nav.resolve_captcha(ocr).await?;
    nav.collect_results().await
}

/// Runs one job to a terminal `CrawlResult`; this boundary never raises.
/// Retryable session failures get a fresh session after a backoff, fatal ones
/// and the wall-clock budget end the job immediately.
async fn run_job<T, F>(
    cfg: Arc<CrawlConfig>,
    make_transport: &F,
    ocr: &dyn CaptchaOcr,
    criteria: SearchCriteria,
) -> CrawlResult
where
    T: Transport,
    F: Fn(&CrawlConfig) -> Result<T, CrawlError>,
{
    let deadline = Instant::now() + cfg.job_timeout;
    let mut last_err: Option<CrawlError> = None;

    for attempt in 1..=cfg.session_retries {
        if attempt > 1 {
            // Never let the backoff carry the job past its deadline.
            let delay =
                backoff_delay(attempt).min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(delay).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_err = Some(CrawlError::Timeout(cfg.job_timeout.as_secs()));
            break;
        }
        let transport = match make_transport(&cfg) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(%err, "could not build transport");
                last_err = Some(err);
                continue;
            }
        };
        info!(job = %criteria.label(), attempt, "starting crawl session");
        let session = run_session(Arc::clone(&cfg), transport, ocr, criteria.clone());
        match tokio::time::timeout(remaining, session).await {
            Ok(Ok(result)) => {
                info!(
                    job = %criteria.label(),
                    status = result.status.label(),
                    records = result.record_count,
                    "job finished"
                );
                return result;
            }
            Ok(Err(err)) if err.retryable() => {
                warn!(job = %criteria.label(), attempt, %err, "session failed, retrying fresh");
                last_err = Some(err);
            }
            Ok(Err(err)) => {
                warn!(job = %criteria.label(), %err, "session failed fatally");
                return CrawlResult::failure(criteria, &err);
            }
            Err(_) => {
                last_err = Some(CrawlError::Timeout(cfg.job_timeout.as_secs()));
                break;
            }
        }
    }

    let err = last_err
        .unwrap_or_else(|| CrawlError::Navigation("no session attempts were made".to_string()));
    CrawlResult::failure(criteria, &err)
}

/// Fans jobs out over a bounded worker set. Each worker builds its own
/// transport so sessions never share cookies, and every terminal result is
/// reported over the event channel before `Finished`.
async fn run_pool<T, F>(
    cfg: Arc<CrawlConfig>,
    make_transport: F,
    ocr: Arc<dyn CaptchaOcr>,
    jobs: Vec<SearchCriteria>,
    events: UnboundedSender<JobEvent>,
) where
    T: Transport + 'static,
    F: Fn(&CrawlConfig) -> Result<T, CrawlError> + Send + Sync + 'static,
{
    let make_transport = Arc::new(make_transport);
    let mut queue: VecDeque<SearchCriteria> = jobs.into();
    let mut workers: JoinSet<CrawlResult> = JoinSet::new();

    loop {
        while workers.len() < cfg.concurrency {
            let Some(criteria) = queue.pop_front() else {
                break;
            };
            let cfg = Arc::clone(&cfg);
            let make_transport = Arc::clone(&make_transport);
            let ocr = Arc::clone(&ocr);
            let events = events.clone();
            workers.spawn(async move {
                events
                    .send(JobEvent::Status(format!("crawling {}", criteria.label())))
                    .ok();
                run_job(cfg, make_transport.as_ref(), ocr.as_ref(), criteria).await
            });
        }
        if workers.is_empty() {
            break;
        }
        match workers.join_next().await {
            Some(Ok(result)) => {
                events.send(JobEvent::Completed(Box::new(result))).ok();
            }
            Some(Err(err)) => {
                events
                    .send(JobEvent::Error(format!("crawl task panicked: {err}")))
                    .ok();
            }
            None => break,
        }
    }
    events.send(JobEvent::Finished).ok();
}

/// Saves the last rendered HTML for postmortems. Failures here never affect
/// the crawl outcome.
fn write_debug_snapshot(cfg: &CrawlConfig, html: &str) {
    let Some(dir) = &cfg.debug_dir else {
        return;
    };
    if html.is_empty() || fs::create_dir_all(dir).is_err() {
        return;
    }
    let path = dir.join(format!(
        "failure_{}.html",
        Utc::now().format("%Y%m%d_%H%M%S_%3f")
    ));
    match fs::write(&path, html) {
        Ok(()) => info!(path = %path.display(), "wrote failure snapshot"),
        Err(err) => warn!(path = %path.display(), %err, "could not write failure snapshot"),
    }
}
