const CSV_HEADERS: [&str; 15] = [
    "search",
    "variant",
    "status",
    "captcha_attempts",
    "page_count",
    "error_detail",
    "doc_no",
    "doc_name",
    "registration_date",
    "sro_name",
    "sro_code",
    "property_description",
    "seller_names",
    "purchaser_names",
    "record_status",
];

struct CsvResultSink {
    writer: csv::Writer<File>,
}

impl CsvResultSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    /// One row per registration record; a result that carries no records
    /// (failures, empty result sets) still gets a single summary row.
    fn write_result(&mut self, result: &CrawlResult) -> io::Result<()> {
        let prefix = [
            result.criteria.label(),
            result.criteria.variant_name().to_string(),
            result.status.label().to_string(),
            result.captcha_attempts.to_string(),
            result.page_count.to_string(),
            result.error_detail.clone().unwrap_or_default(),
        ];
        if result.records.is_empty() {
            let mut row = prefix.to_vec();
            row.extend(std::iter::repeat_n(String::new(), 9));
            self.writer.write_record(&row)?;
            return Ok(());
        }
        for record in &result.records {
            let mut row = prefix.to_vec();
            row.extend([
                record.doc_no.clone(),
                record.doc_name.clone(),
                record.registration_date.clone(),
                record.sro_name.clone(),
                record.sro_code.clone(),
                record.property_description.clone(),
                record.seller_names.join("|"),
                record.purchaser_names.join("|"),
                record.status.clone(),
            ]);
            self.writer.write_record(&row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonResultSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonResultSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_result(&mut self, result: &CrawlResult) -> io::Result<()> {
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, result).map_err(io::Error::other)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonResultSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum ResultSink {
    Csv(CsvResultSink),
    Json(JsonResultSink),
}

impl ResultSink {
    fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(ResultSink::Csv(CsvResultSink::new(output_path)?)),
            DataFormat::Json => Ok(ResultSink::Json(JsonResultSink::new(output_path)?)),
        }
    }

    fn write_result(&mut self, result: &CrawlResult) -> io::Result<()> {
        match self {
            ResultSink::Csv(sink) => sink.write_result(result),
            ResultSink::Json(sink) => sink.write_result(result),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ResultSink::Csv(sink) => sink.flush(),
            ResultSink::Json(sink) => sink.flush(),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            ResultSink::Csv(sink) => sink.flush(),
            ResultSink::Json(sink) => sink.finalize(),
        }
    }
}

/// Batch files are a JSON array of criteria objects tagged by `kind`.
fn load_jobs_from_file(path: &str) -> io::Result<Vec<SearchCriteria>> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str::<Vec<SearchCriteria>>(&content)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

fn default_output_path(format: DataFormat) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("igr_results_{ts}.csv"),
        DataFormat::Json => format!("igr_results_{ts}.json"),
    }
}
