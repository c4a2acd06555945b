const RESULTS_GRID_ID: &str = "RegistrationGrid";
const PAGER_ROW_STYLE_MARKER: &str = "cccccc";

/// Header labels that identify a registration grid when the id attribute is
/// missing (older portal skins render the same grid without it).
const GRID_HEADER_KEYWORDS: [&str; 7] = [
    "docno",
    "document",
    "registration",
    "sro",
    "date",
    "seller",
    "purchaser",
];

static DO_POSTBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__doPostBack\('([^']*)','([^']*)'\)").unwrap()
});

static QUOTED_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).unwrap());

/// Locates the results grid in a rendered page, in order of confidence: the
/// well-known id, then any table whose header row matches enough grid
/// keywords, then any table that has more than a lone header row. Returns the
/// grid's outer HTML so callers can work on a stable fragment.
fn find_results_table(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    if let Ok(selector) = Selector::parse(&format!("table#{RESULTS_GRID_ID}")) {
        if let Some(table) = doc.select(&selector).next() {
            return Some(table.html());
        }
    }

    let table_sel = Selector::parse("table").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let mut fallback: Option<String> = None;
    for table in doc.select(&table_sel) {
        let headers = header_labels(&table);
        let hits = headers
            .iter()
            .filter(|h| {
                let h = h.to_lowercase();
                GRID_HEADER_KEYWORDS.iter().any(|kw| h.contains(kw))
            })
            .count();
        if hits >= 2 {
            return Some(table.html());
        }
        if fallback.is_none() && table.select(&row_sel).count() > 1 {
            fallback = Some(table.html());
        }
    }
    fallback
}

fn header_labels(table: &ElementRef) -> Vec<String> {
    let Ok(th_sel) = Selector::parse("th") else {
        return Vec::new();
    };
    table.select(&th_sel).map(|th| cell_text(&th)).collect()
}

/// The grid column a header label maps onto. Matching is by substring on the
/// lowercased label so minor header churn does not break extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridColumn {
    DocNo,
    DocName,
    RegistrationDate,
    SroCode,
    SroName,
    PropertyDescription,
    SellerNames,
    PurchaserNames,
    Status,
}

fn classify_header(label: &str) -> Option<GridColumn> {
    let label = label.to_lowercase().replace(['.', ':'], " ");
    let compact: String = label.split_whitespace().collect();
    if compact.contains("docno") || compact.contains("documentno") {
        Some(GridColumn::DocNo)
    } else if compact.contains("docname") || compact.contains("documentname") {
        Some(GridColumn::DocName)
    } else if label.contains("date") {
        Some(GridColumn::RegistrationDate)
    } else if label.contains("sro") && label.contains("code") {
        Some(GridColumn::SroCode)
    } else if label.contains("sro") {
        Some(GridColumn::SroName)
    } else if label.contains("seller") {
        Some(GridColumn::SellerNames)
    } else if label.contains("purchaser") || label.contains("buyer") {
        Some(GridColumn::PurchaserNames)
    } else if label.contains("property") {
        Some(GridColumn::PropertyDescription)
    } else if label.contains("status") {
        Some(GridColumn::Status)
    } else {
        None
    }
}

/// Structures one grid fragment into records. Pure over its input: feeding the
/// same fragment twice yields identical output, and pager rows or button-only
/// cells never produce records.
fn extract_records(table_html: &str) -> Vec<RegistrationRecord> {
    let fragment = Html::parse_fragment(table_html);
    let (Ok(row_sel), Ok(cell_sel), Ok(input_sel)) = (
        Selector::parse("tr"),
        Selector::parse("th, td"),
        Selector::parse("input"),
    ) else {
        return Vec::new();
    };

    let mut columns: Vec<Option<GridColumn>> = Vec::new();
    let mut records = Vec::new();
    for row in fragment.select(&row_sel) {
        if is_pager_row(&row) {
            continue;
        }
        let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
        if cells.is_empty() {
            continue;
        }
        if columns.is_empty() {
            columns = cells
                .iter()
                .map(|cell| classify_header(&cell_text(cell)))
                .collect();
            continue;
        }

        let mut record = RegistrationRecord::default();
        let mut matched = false;
        for (idx, cell) in cells.iter().enumerate() {
            // Action-button cells carry no data; keep the slot so later
            // columns stay aligned with the header row.
            if cell.select(&input_sel).next().is_some() {
                continue;
            }
            let Some(Some(column)) = columns.get(idx) else {
                continue;
            };
            let text = cell_text(cell);
            matched = true;
            match column {
                GridColumn::DocNo => record.doc_no = text,
                GridColumn::DocName => record.doc_name = text,
                GridColumn::RegistrationDate => record.registration_date = text,
                GridColumn::SroCode => record.sro_code = text,
                GridColumn::SroName => record.sro_name = text,
                GridColumn::PropertyDescription => record.property_description = text,
                GridColumn::SellerNames => record.seller_names = split_name_list(&text),
                GridColumn::PurchaserNames => record.purchaser_names = split_name_list(&text),
                GridColumn::Status => record.status = text,
            }
        }
        if matched && record != RegistrationRecord::default() {
            records.push(record);
        }
    }
    records
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_pager_row(row: &ElementRef) -> bool {
    row.value()
        .attr("style")
        .map(|style| style.to_lowercase().contains(PAGER_ROW_STYLE_MARKER))
        .unwrap_or(false)
}

/// Party columns arrive either as a plain name or as a brace-delimited list,
/// `{First Name,Second Name}`, occasionally with quoted entries. Always
/// returns an array; a bare name becomes a one-element list.
fn split_name_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Some(inner) = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return vec![trimmed.to_string()];
    };
    if inner.contains('\'') || inner.contains('"') {
        let quoted: Vec<String> = QUOTED_NAME_RE
            .captures_iter(inner)
            .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if !quoted.is_empty() {
            return quoted;
        }
    }
    inner
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// One pager cell that is clickable. The current page renders as a bare span
/// and therefore never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PageLink {
    label: String,
    target: String,
    argument: String,
}

fn pagination_links(table_html: &str) -> Vec<PageLink> {
    let fragment = Html::parse_fragment(table_html);
    let (Ok(row_sel), Ok(anchor_sel)) = (Selector::parse("tr"), Selector::parse("a[href]")) else {
        return Vec::new();
    };
    let mut links = Vec::new();
    for row in fragment.select(&row_sel) {
        if !is_pager_row(&row) {
            continue;
        }
        for anchor in row.select(&anchor_sel) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(caps) = DO_POSTBACK_RE.captures(href) else {
                continue;
            };
            links.push(PageLink {
                label: cell_text(&anchor),
                target: caps[1].to_string(),
                argument: caps[2].to_string(),
            });
        }
    }
    links
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NextPageAction {
    /// Last page of the result set reached.
    Stop,
    /// Click `link` to land on absolute page `page` within the current set.
    Advance { link: PageLink, page: u32 },
    /// Click the trailing ellipsis to open the next page set; the pager's
    /// numeric labels restart from 1 on the far side, offset by `base`.
    AdvanceWindow { link: PageLink, base: u32 },
}

/// Decides the next pager click. `current` is the absolute page just
/// harvested, `base` the offset of the current page set (0 for the first).
/// Labels inside a later set are relative, so a label L at base B means
/// absolute page B + L.
fn next_page_action(links: &[PageLink], current: u32, base: u32, window: u32) -> NextPageAction {
    let mut max_seen = current;
    let mut advance: Option<(PageLink, u32)> = None;
    let mut trailing_ellipsis: Option<PageLink> = None;

    for (idx, link) in links.iter().enumerate() {
        if link.label == "..." {
            // In a later set the first cell is the backward ellipsis; it may
            // also be the only link on the final page, so test it first.
            if idx == 0 && base > 0 {
                continue;
            }
            if idx + 1 == links.len() {
                trailing_ellipsis = Some(link.clone());
            }
            continue;
        }
        let Ok(label) = link.label.parse::<u32>() else {
            continue;
        };
        let page = if base > 0 && label <= window {
            base + label
        } else {
            label
        };
        max_seen = max_seen.max(page);
        if page == current + 1 && advance.is_none() {
            advance = Some((link.clone(), page));
        }
    }

    if let Some((link, page)) = advance {
        return NextPageAction::Advance { link, page };
    }
    if current >= max_seen {
        if let Some(link) = trailing_ellipsis {
            return NextPageAction::AdvanceWindow {
                link,
                base: (current / window) * window,
            };
        }
    }
    NextPageAction::Stop
}

#[cfg(test)]
mod extract_tests {
    use super::*;

    fn grid(rows: &str) -> String {
        format!(
            r#"<table id="RegistrationGrid" border="1">
                <tr><th>DocNo</th><th>DocName</th><th>RDate</th><th>SROName</th>
                    <th>SellerName</th><th>PurchaserName</th><th>PropertyDescription</th>
                    <th>SROCode</th><th>Status</th><th></th></tr>
                {rows}
            </table>"#
        )
    }

    const PUNE_ROW: &str = r#"<tr><td>4521/2023</td><td>Sale Deed</td><td>12/05/2023</td>
        <td>Haveli 3</td><td>{Anil Deshmukh,Sunita Deshmukh}</td><td>Rahul Patil</td>
        <td>Survey 15, Kothrud</td><td>HVL3</td><td>Registered</td>
        <td><input type="button" value="IndexII" /></td></tr>"#;

    #[test]
    fn records_are_extracted_with_name_lists_split() {
        let table = find_results_table(&grid(PUNE_ROW)).expect("grid not found");
        let records = extract_records(&table);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.doc_no, "4521/2023");
        assert_eq!(record.doc_name, "Sale Deed");
        assert_eq!(record.registration_date, "12/05/2023");
        assert_eq!(record.sro_name, "Haveli 3");
        assert_eq!(record.sro_code, "HVL3");
        assert_eq!(record.status, "Registered");
        assert_eq!(record.seller_names, vec!["Anil Deshmukh", "Sunita Deshmukh"]);
        assert_eq!(record.purchaser_names, vec!["Rahul Patil"]);
    }

    #[test]
    fn grid_without_id_is_found_by_header_keywords() {
        let html = r#"<html><body>
            <table><tr><td>nav</td></tr><tr><td>menu</td></tr></table>
            <table><tr><th>DocNo</th><th>SROName</th><th>RDate</th></tr>
                   <tr><td>1/2023</td><td>Haveli 1</td><td>01/01/2023</td></tr>
            </table></body></html>"#;
        let table = find_results_table(html).expect("keyword match failed");
        let records = extract_records(&table);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].doc_no, "1/2023");
    }

    #[test]
    fn page_without_any_grid_yields_nothing() {
        assert!(find_results_table("<html><body><p>No records</p></body></html>").is_none());
    }

    #[test]
    fn extraction_is_idempotent() {
        let table = find_results_table(&grid(PUNE_ROW)).unwrap();
        let first = extract_records(&table);
        let second = extract_records(&table);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn plain_name_becomes_single_element_list() {
        assert_eq!(split_name_list("Rahul Patil"), vec!["Rahul Patil"]);
        assert_eq!(
            split_name_list("{A One, B Two ,C Three}"),
            vec!["A One", "B Two", "C Three"]
        );
        assert_eq!(
            split_name_list(r#"{'Patil, Rahul','Joshi, Meena'}"#),
            vec!["Patil, Rahul", "Joshi, Meena"]
        );
        assert!(split_name_list("  ").is_empty());
    }

    #[test]
    fn pager_rows_never_become_records() {
        let rows = format!(
            r#"{PUNE_ROW}
            <tr style="background-color:#CCCCCC"><td colspan="10">
                <span>1</span>
                <a href="javascript:__doPostBack('RegistrationGrid','Page$2')">2</a>
                <a href="javascript:__doPostBack('RegistrationGrid','Page$3')">3</a>
            </td></tr>"#
        );
        let table = find_results_table(&grid(&rows)).unwrap();
        assert_eq!(extract_records(&table).len(), 1);
        let links = pagination_links(&table);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].label, "2");
        assert_eq!(links[0].target, "RegistrationGrid");
        assert_eq!(links[0].argument, "Page$2");
    }

    fn link(label: &str, arg: &str) -> PageLink {
        PageLink {
            label: label.to_string(),
            target: RESULTS_GRID_ID.to_string(),
            argument: arg.to_string(),
        }
    }

    #[test]
    fn advances_to_the_next_numeric_label() {
        let links = vec![link("2", "Page$2"), link("3", "Page$3")];
        match next_page_action(&links, 1, 0, 10) {
            NextPageAction::Advance { link, page } => {
                assert_eq!(page, 2);
                assert_eq!(link.argument, "Page$2");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn stops_on_the_final_page() {
        let links = vec![link("1", "Page$1"), link("2", "Page$2")];
        assert_eq!(next_page_action(&links, 3, 0, 10), NextPageAction::Stop);
    }

    #[test]
    fn trailing_ellipsis_opens_the_next_page_set() {
        let mut links: Vec<PageLink> = (1..=9)
            .map(|n| link(&n.to_string(), &format!("Page${n}")))
            .collect();
        links.push(link("...", "Page$11"));
        match next_page_action(&links, 10, 0, 10) {
            NextPageAction::AdvanceWindow { link, base } => {
                assert_eq!(base, 10);
                assert_eq!(link.argument, "Page$11");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn relative_labels_in_a_later_set_are_offset_by_base() {
        // After the ellipsis click the pager shows "... 1 2" for absolute
        // pages 11 and 12; a leading ellipsis must not re-trigger a set jump.
        let links = vec![link("...", "Page$10"), link("2", "Page$12")];
        match next_page_action(&links, 11, 10, 10) {
            NextPageAction::Advance { page, .. } => assert_eq!(page, 12),
            other => panic!("unexpected action {other:?}"),
        }
        let last_set = vec![link("...", "Page$10"), link("1", "Page$11")];
        assert_eq!(next_page_action(&last_set, 11, 10, 10), NextPageAction::Stop);
    }
}
