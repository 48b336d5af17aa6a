//! Markup pattern matching, used when structured element queries come back
//! empty (class names rendered differently, partial hydration, etc).

use std::sync::LazyLock;

use regex::Regex;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

static TITLE_NESTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<[^>]*class="[^"]*live-build-info[^"]*"[^>]*>.*?<[^>]*class="[^"]*content[^"]*"[^>]*>.*?<[^>]*class="[^"]*title[^"]*"[^>]*>.*?<[^>]*class="[^"]*text-wrap[^"]*"[^>]*>([^<]+)</"#,
    )
    .expect("valid regex")
});

static TITLE_LOOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="text-wrap"[^>]*>([^<]+)</"#).expect("valid regex"));

static SUMMARY_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<div[^>]*class="live-data-card-summary-label"[^>]*>([^<]+)</div>\s*<div[^>]*class="live-data-card-summary-value"[^>]*>\s*([^<]*?)\s*</div>"#,
    )
    .expect("valid regex")
});

static LEGEND_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<div[^>]*class="reverse-data-legend-name"[^>]*>([^<]+)</div>\s*<div[^>]*class="reverse-data-legend-count"[^>]*>([0-9,\s]+)</div>"#,
    )
    .expect("valid regex")
});

static THEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<thead[^>]*class="[^"]*ant-table[^"]*"[^>]*>.*?</thead>"#).expect("valid regex")
});

static TH_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<th[^>]*>(.*?)</th>").expect("valid regex"));

static TH_ANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<th[^>]*class="[^"]*ant-table[^"]*"[^>]*>(.*?)</th>"#).expect("valid regex")
});

static TR_ANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<tr[^>]*class="[^"]*ant-table[^"]*"[^>]*>(.*?)</tr>"#).expect("valid regex")
});

static TD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<td[^>]*>(.*?)</td>").expect("valid regex"));

/// Removes tags and collapses runs of whitespace.
pub fn strip_tags(fragment: &str) -> String {
    let text = TAG.replace_all(fragment, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn title(source: &str) -> Option<String> {
    [&*TITLE_NESTED, &*TITLE_LOOSE]
        .iter()
        .find_map(|re| re.captures(source))
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Value of the summary card whose label contains `label`.
pub fn summary_value(source: &str, label: &str) -> Option<String> {
    SUMMARY_PAIR
        .captures_iter(source)
        .find(|c| c[1].contains(label))
        .map(|c| c[2].trim().to_string())
}

/// `(name, count)` for every breakdown legend entry in the markup.
pub fn legend_entries(source: &str) -> Vec<(String, String)> {
    LEGEND_PAIR
        .captures_iter(source)
        .map(|c| (c[1].trim().to_string(), c[2].trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Table header texts: the ant-table `<thead>` if present, otherwise any
/// ant-table `<th>`. Blank headers are skipped.
pub fn table_headers(source: &str) -> Vec<String> {
    let cells: Vec<String> = match THEAD.find(source) {
        Some(head) => TH_ANY
            .captures_iter(head.as_str())
            .map(|c| strip_tags(&c[1]))
            .collect(),
        None => TH_ANT
            .captures_iter(source)
            .map(|c| strip_tags(&c[1]))
            .collect(),
    };
    cells.into_iter().filter(|h| !h.is_empty()).collect()
}

/// Cell texts of every ant-table row that has at least one `<td>`.
pub fn table_rows(source: &str) -> Vec<Vec<String>> {
    TR_ANT
        .captures_iter(source)
        .map(|tr| {
            TD.captures_iter(&tr[1])
                .map(|td| strip_tags(&td[1]))
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVE: &str = r#"
        <div class="live-build-info"><div class="content"><div class="title">
          <span class="text-wrap"> Spring launch </span></div></div></div>
        <div class="live-data-card-summary-label">预约人数</div>
        <div class="live-data-card-summary-value"> 1,204 </div>
        <div class="live-data-card-summary-label">预约转化率</div>
        <div class="live-data-card-summary-value">12.5%</div>
        <div class="reverse-data-legend-name">Moments</div><div class="reverse-data-legend-count">700</div>
        <div class="reverse-data-legend-name">Search</div>
        <div class="reverse-data-legend-count">504</div>
    "#;

    #[test]
    fn reservation_fields_from_markup() {
        assert_eq!(title(RESERVE).as_deref(), Some("Spring launch"));
        assert_eq!(summary_value(RESERVE, "预约人数").as_deref(), Some("1,204"));
        assert_eq!(summary_value(RESERVE, "预约转化率").as_deref(), Some("12.5%"));
        assert_eq!(summary_value(RESERVE, "missing"), None);
        assert_eq!(
            legend_entries(RESERVE),
            vec![
                ("Moments".to_string(), "700".to_string()),
                ("Search".to_string(), "504".to_string())
            ]
        );
    }

    #[test]
    fn table_from_markup() {
        let html = r#"
            <table><thead class="ant-table-thead"><tr>
              <th class="ant-table-cell"><span>Product</span></th>
              <th class="ant-table-cell">  Sales
                 volume </th>
              <th class="ant-table-cell"></th>
            </tr></thead>
            <tbody class="ant-table-tbody">
              <tr class="ant-table-row"><td><b>Cup</b></td><td>12</td></tr>
              <tr class="ant-table-row"><td>Bowl</td><td>3</td><td>x</td></tr>
              <tr class="ant-table-placeholder"></tr>
            </tbody></table>"#;
        assert_eq!(table_headers(html), vec!["Product", "Sales volume"]);
        assert_eq!(
            table_rows(html),
            vec![vec!["Cup", "12"], vec!["Bowl", "3", "x"]]
        );
    }

    #[test]
    fn headers_fall_back_to_loose_th_cells() {
        let html = r#"<tr><th class="ant-table-cell">A</th><th class="ant-table-cell">B</th></tr>"#;
        assert_eq!(table_headers(html), vec!["A", "B"]);
        assert_eq!(title("<p>nothing</p>"), None);
    }
}
