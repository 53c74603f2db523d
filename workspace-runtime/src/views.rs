//! Minimal HTML pages served by the front.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><main><h1>{title}</h1>{body}</main></body></html>\n"
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn login(status: StatusCode, notice: Option<&str>) -> Response {
    let notice = notice
        .map(|n| format!("<p class=\"notice\">{}</p>", escape(n)))
        .unwrap_or_default();
    let body = format!("{notice}<p><a href=\"/login\">Sign in with GitHub</a> to open your workspace.</p>");
    (status, Html(page("Workspace", &body))).into_response()
}

pub fn deny() -> Response {
    (
        StatusCode::FORBIDDEN,
        Html(page(
            "Access denied",
            "<p>This account is not allowed to use a workspace.</p><p><a href=\"/logout\">Sign out</a></p>",
        )),
    )
        .into_response()
}

pub fn signed_out() -> Response {
    (
        StatusCode::OK,
        Html(page("Signed out", "<p><a href=\"/login\">Sign in again</a></p>")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_is_escaped() {
        let html = page("t", &format!("<p>{}</p>", escape("<script>")));
        assert!(html.contains("&lt;script&gt;"));
        assert_eq!(login(StatusCode::SERVICE_UNAVAILABLE, None).status(), 503);
    }
}
