use crate::CalendarError;
use calsync_core::RemoteEvent;
use serde::Deserialize;

const DEFAULT_PAGE_SIZE: u32 = 250;

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    items: Vec<RemoteEvent>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

/// Fetches every plugin-owned event on the calendar, following
/// `nextPageToken` until exhausted (spec.md §4.2: "Remote event fetch").
/// Filters server-side on `privateExtendedProperty=isGcalSync=true` and
/// `showDeleted=false`, and expands recurring events client-side by
/// requesting `singleEvents=false` so recurrence masters come back intact.
pub async fn fetch_plugin_owned_events(
    http: &reqwest::Client,
    access_token: &str,
    calendar_id: &str,
) -> Result<Vec<RemoteEvent>, CalendarError> {
    let mut events = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let url = format!(
            "https://www.googleapis.com/calendar/v3/calendars/{}/events",
            urlencode(calendar_id)
        );

        let mut request = http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("privateExtendedProperty", "isGcalSync=true"),
                ("showDeleted", "false"),
                ("singleEvents", "false"),
            ])
            .query(&[("maxResults", DEFAULT_PAGE_SIZE)]);

        if let Some(token) = &page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }

        let response = request.send().await?;
        let response = response.error_for_status().map_err(|err| {
            CalendarError::Fetch(format!("remote event list request failed: {err}"))
        })?;

        let page: EventsPage = response
            .json()
            .await
            .map_err(|err| CalendarError::Fetch(format!("malformed events page: {err}")))?;

        events.extend(page.items.into_iter().filter(RemoteEvent::is_plugin_owned));

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(events)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_preserves_unreserved_characters() {
        assert_eq!(urlencode("primary"), "primary");
        assert_eq!(urlencode("a b@c"), "a%20b%40c");
    }
}
