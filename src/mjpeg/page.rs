use crate::capture::StreamConfig;

/// Viewer page for `GET /`.
pub fn index_html(stream: &StreamConfig) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Camera Stream</title>
  <style>
    body {{ font-family: sans-serif; background: #111; color: #eee; text-align: center; }}
    img {{ max-width: 100%; border: 1px solid #444; }}
    .info {{ color: #aaa; margin: 0.5em 0; }}
  </style>
</head>
<body>
  <h1>Camera Stream</h1>
  <p class="info">Resolution: {width}x{height} | Quality: {quality} | Target FPS: {fps}</p>
  <img src="/video_feed" alt="live camera stream">
  <p class="info">If the stream stalls, reload the page. <a href="/video_feed">Raw stream</a></p>
</body>
</html>
"#,
        width = stream.width,
        height = stream.height,
        quality = stream.quality,
        fps = stream.frame_rate,
    )
}
