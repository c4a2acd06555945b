fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn invalid_input(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// Builds the job list: a batch file wins, otherwise one job from the flags.
/// `--document-number` selects the document variant, which pairs with `--sro`
/// instead of tahsil/village.
fn build_jobs(cli: &Cli) -> io::Result<Vec<SearchCriteria>> {
    if let Some(path) = &cli.jobs {
        let jobs = load_jobs_from_file(path)?;
        if jobs.is_empty() {
            return Err(invalid_input("batch file holds no jobs"));
        }
        return Ok(jobs);
    }

    let year = cli
        .year
        .clone()
        .ok_or_else(|| invalid_input("--year is required"))?;
    let district = cli
        .district
        .clone()
        .ok_or_else(|| invalid_input("--district is required"))?;

    if let Some(document_number) = cli.document_number.clone() {
        let sro_office = cli
            .sro_office
            .clone()
            .ok_or_else(|| invalid_input("--sro is required with --document-number"))?;
        return Ok(vec![SearchCriteria::Document {
            year,
            district,
            sro_office,
            document_number,
        }]);
    }

    let tahsil = cli
        .tahsil
        .clone()
        .ok_or_else(|| invalid_input("--tahsil is required"))?;
    let village = cli
        .village
        .clone()
        .ok_or_else(|| invalid_input("--village is required"))?;
    let property_number = cli
        .property_number
        .clone()
        .ok_or_else(|| invalid_input("--property-number is required"))?;
    Ok(vec![SearchCriteria::Attribute {
        year,
        district,
        tahsil,
        village,
        property_number,
    }])
}

pub async fn run() -> io::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let jobs = build_jobs(&cli)?;
    let cfg = Arc::new(
        CrawlConfig::from_cli(&cli).map_err(|err| invalid_input(&err.to_string()))?,
    );

    let output_format: DataFormat = cli.format.into();
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(output_format));
    let mut sink = ResultSink::new(&output_path, output_format)?;

    info!(
        jobs = jobs.len(),
        concurrency = cfg.concurrency,
        output = %output_path,
        "starting crawl"
    );

    let (events, mut results) = mpsc::unbounded_channel::<JobEvent>();
    let ocr: Arc<dyn CaptchaOcr> = Arc::new(TesseractOcr::new(&cfg.tesseract_cmd));
    let pool = tokio::spawn(run_pool(
        Arc::clone(&cfg),
        |cfg: &CrawlConfig| HttpTransport::new(cfg),
        ocr,
        jobs,
        events,
    ));

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut records = 0usize;
    while let Some(event) = results.recv().await {
        match event {
            JobEvent::Status(message) => info!("{message}"),
            JobEvent::Error(message) => warn!("{message}"),
            JobEvent::Completed(result) => {
                completed += 1;
                if result.status == CrawlStatus::Failure {
                    failed += 1;
                }
                records += result.record_count;
                sink.write_result(&result)?;
                sink.flush()?;
            }
            JobEvent::Finished => break,
        }
    }
    sink.finalize()?;

    if let Err(err) = pool.await {
        warn!(%err, "crawl pool join error");
    }
    info!(completed, failed, records, output = %output_path, "crawl finished");
    Ok(())
}

#[cfg(test)]
mod runtime_tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["igr-crawler"];
        argv.extend(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_build_an_attribute_job() {
        let cli = parse(&[
            "--year",
            "2023",
            "--district",
            "Pune",
            "--tahsil",
            "Haveli",
            "--village",
            "X",
            "--property-number",
            "15",
        ]);
        let jobs = build_jobs(&cli).unwrap();
        assert_eq!(
            jobs,
            vec![SearchCriteria::Attribute {
                year: "2023".into(),
                district: "Pune".into(),
                tahsil: "Haveli".into(),
                village: "X".into(),
                property_number: "15".into(),
            }]
        );
    }

    #[test]
    fn document_number_switches_the_variant() {
        let cli = parse(&[
            "--year",
            "2022",
            "--district",
            "Pune",
            "--sro",
            "Haveli 3",
            "--document-number",
            "4521",
        ]);
        let jobs = build_jobs(&cli).unwrap();
        assert!(matches!(jobs[0], SearchCriteria::Document { .. }));
    }

    #[test]
    fn incomplete_flags_are_rejected() {
        let cli = parse(&["--year", "2023", "--district", "Pune"]);
        let err = build_jobs(&cli).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let cli = parse(&["--year", "2023", "--district", "Pune", "--document-number", "4521"]);
        assert!(build_jobs(&cli).is_err());
    }

    #[test]
    fn batch_file_overrides_individual_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let jobs = vec![SearchCriteria::Document {
            year: "2022".into(),
            district: "Pune".into(),
            sro_office: "Haveli 3".into(),
            document_number: "4521".into(),
        }];
        fs::write(&path, serde_json::to_string(&jobs).unwrap()).unwrap();

        let cli = parse(&["--jobs", path.to_str().unwrap()]);
        assert_eq!(build_jobs(&cli).unwrap(), jobs);

        fs::write(&path, "[]").unwrap();
        let cli = parse(&["--jobs", path.to_str().unwrap()]);
        assert!(build_jobs(&cli).is_err());
    }
}
