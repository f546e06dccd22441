//! Remote ad-server lists and their parsers.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::{DOWNLOAD_TIMEOUT, fetch_text};

/// A list with fewer entries than this is assumed to be truncated or broken.
pub const MIN_ENTRIES: usize = 100;

/// Marker preceding blocked names in a hosts file.
const HOSTS_MARKER: &str = "0.0.0.0";

/// License terms of the MVPS hosts file, logged whenever it is applied.
pub const MVPS_LICENSE: &str = "Disclaimer: this file is free to use for personal use only. \
    Furthermore it is NOT permitted to copy any of the contents or host on any other site \
    without permission or meeting the full criteria of the below license terms. This work is \
    licensed under the Creative Commons Attribution-NonCommercial-ShareAlike License. \
    http://creativecommons.org/licenses/by-nc-sa/4.0/ License info for commercial purposes \
    contact Winhelp2002";

/// Layout of a remote list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    /// One domain per line.
    Plain,
    /// `0.0.0.0 domain # comment` lines.
    Hosts,
}

/// A remote list of ad-server domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistSource {
    pub name: String,
    pub url: String,
    pub format: ListFormat,
    /// Logged when entries from this source are applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

impl BlacklistSource {
    /// The pgl.yoyo.org plain-text ad-server list.
    pub fn pgl() -> Self {
        Self {
            name: "PGL".to_string(),
            url: "https://pgl.yoyo.org/adservers/serverlist.php?hostformat=nohtml&showintro=0&mimetype=plaintext".to_string(),
            format: ListFormat::Plain,
            license: None,
        }
    }

    /// The winhelp2002.mvps.org hosts file.
    pub fn mvps() -> Self {
        Self {
            name: "MVPS".to_string(),
            url: "http://winhelp2002.mvps.org/hosts.txt".to_string(),
            format: ListFormat::Hosts,
            license: Some(MVPS_LICENSE.to_string()),
        }
    }

    /// Both default sources.
    pub fn defaults() -> Vec<Self> {
        vec![Self::pgl(), Self::mvps()]
    }

    /// Download and parse the list, refusing suspiciously short results.
    pub async fn fetch(&self, client: &Client) -> Result<Vec<String>> {
        let body = fetch_text(client, &self.url, DOWNLOAD_TIMEOUT).await?;
        self.parse(&body)
    }

    /// Parse a downloaded body according to the source format.
    pub fn parse(&self, body: &str) -> Result<Vec<String>> {
        let names = match self.format {
            ListFormat::Plain => parse_plain(body),
            ListFormat::Hosts => parse_hosts(body),
        };
        if names.len() < MIN_ENTRIES {
            return Err(Error::ShortList {
                list: self.name.clone(),
                count: names.len(),
            });
        }
        Ok(names)
    }
}

/// One domain per line; blank lines are skipped.
pub fn parse_plain(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Names following `0.0.0.0` up to a `#` comment or end of line.
///
/// Lines without the marker, or where the marker only appears inside a
/// comment, are skipped.
pub fn parse_hosts(body: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(16384);
    for line in body.lines() {
        let Some(marker) = line.find(HOSTS_MARKER) else {
            continue;
        };
        let name_end = line.find('#').unwrap_or(line.len());
        let name_begin = marker + HOSTS_MARKER.len();
        if name_begin >= name_end {
            continue;
        }
        let name = line[name_begin..name_end].trim();
        if !name.is_empty() {
            names.push(name.to_lowercase());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_body(count: usize) -> String {
        (0..count)
            .map(|i| format!("ads{i}.example.com\n"))
            .collect()
    }

    #[test]
    fn plain_trims_and_skips_blank_lines() {
        let names = parse_plain("  ads.example.com \r\n\n\tTracker.Example.NET\n   \n");

        assert_eq!(names, vec!["ads.example.com", "tracker.example.net"]);
    }

    #[test]
    fn hosts_extracts_names_after_marker() {
        let body = "\
# This is the MVPS hosts file
127.0.0.1  localhost
0.0.0.0 ads.example.com
0.0.0.0 tracker.example.com  #[Tracking Cookie]
   0.0.0.0\tcdn.ads.example.org
# comment mentioning 0.0.0.0
0.0.0.0
0.0.0.0   # empty entry
";

        assert_eq!(
            parse_hosts(body),
            vec![
                "ads.example.com",
                "tracker.example.com",
                "cdn.ads.example.org"
            ]
        );
    }

    #[test]
    fn short_plain_list_is_rejected() {
        let err = BlacklistSource::pgl().parse(&plain_body(99)).unwrap_err();

        assert!(matches!(err, Error::ShortList { count: 99, .. }));
    }

    #[test]
    fn blank_lines_do_not_count_towards_minimum() {
        let body = format!("{}{}", plain_body(60), "\n".repeat(200));

        assert!(BlacklistSource::pgl().parse(&body).is_err());
    }

    #[test]
    fn short_hosts_list_is_rejected() {
        let body: String = (0..50).map(|i| format!("0.0.0.0 ad{i}.com\n")).collect();

        assert!(matches!(
            BlacklistSource::mvps().parse(&body),
            Err(Error::ShortList { count: 50, .. })
        ));
    }

    #[test]
    fn lists_at_minimum_are_accepted() {
        let hosts: String = (0..MIN_ENTRIES)
            .map(|i| format!("0.0.0.0 ad{i}.com # ad\n"))
            .collect();

        assert_eq!(BlacklistSource::pgl().parse(&plain_body(MIN_ENTRIES)).unwrap().len(), 100);
        assert_eq!(BlacklistSource::mvps().parse(&hosts).unwrap().len(), 100);
    }

    #[test]
    fn source_config_deserializes_from_json() {
        let json = r#"{"name":"custom","url":"http://localhost/list","format":"hosts"}"#;
        let source: BlacklistSource = serde_json::from_str(json).unwrap();

        assert_eq!(source.format, ListFormat::Hosts);
        assert_eq!(source.license, None);
    }
}
