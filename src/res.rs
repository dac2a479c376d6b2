use axum::response::Html;

#[macro_export]
macro_rules! include_res {
    (str, $p:expr) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
}

/// Page served to an admitted participant. Only called for rooms that exist,
/// so `room_id` is one we generated.
pub(crate) fn room_page(room_id: &str) -> Html<String> {
    Html(include_res!(str, "/pages/room.html").replace("{room_id}", room_id))
}
