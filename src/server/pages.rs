// src/server/pages.rs
// HTML pages served next to the progress WebSocket

/// Live monitor page for one job. The id is validated before this renders.
pub fn monitor_html(job_id: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Job Monitor - {job_id}</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: sans-serif; margin: 0; padding: 20px; background: #f5f5f5; }}
        .container {{ max-width: 800px; margin: 0 auto; background: white; padding: 30px; border-radius: 10px; }}
        .job-id {{ font-family: monospace; background: #f0f0f0; padding: 5px 10px; border-radius: 5px; }}
        .status {{ margin: 20px 0; padding: 15px; border-radius: 5px; font-weight: bold; }}
        .status.running {{ background: #e3f2fd; color: #1976d2; }}
        .status.completed {{ background: #e8f5e8; color: #388e3c; }}
        .status.failed {{ background: #ffebee; color: #d32f2f; }}
        .status.waiting {{ background: #fff3e0; color: #f57c00; }}
        .log {{ margin: 20px 0; padding: 15px; background: #1a1a1a; color: #0f0; font-family: monospace; border-radius: 5px; max-height: 300px; overflow-y: auto; font-size: 12px; }}
        progress {{ width: 100%; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Crackerjack Job Monitor</h1>
        <p>Job ID: <span class="job-id">{job_id}</span></p>
        <div class="status waiting" id="status">Connecting...</div>
        <progress id="bar" max="100" value="0"></progress>
        <div class="log" id="log"></div>
    </div>
    <script>
        const jobId = '{job_id}';
        const ws = new WebSocket(`ws://${{location.host}}/ws/progress/${{jobId}}`);
        const log = (line) => {{
            const el = document.getElementById('log');
            el.innerHTML += `<div>${{line}}</div>`;
            el.scrollTop = el.scrollHeight;
        }};
        ws.onopen = () => log('Connected');
        ws.onclose = (e) => log(`Closed (${{e.code}})`);
        ws.onmessage = (event) => {{
            const data = JSON.parse(event.data);
            if (data.type === 'echo') return;
            const status = document.getElementById('status');
            status.className = `status ${{data.status}}`;
            status.textContent = `${{data.status}} — ${{data.message || ''}}`;
            document.getElementById('bar').value = data.overall_progress || 0;
            log(`[${{data.current_stage}}] ${{data.overall_progress}}% ${{data.message || ''}}`);
        }};
    </script>
</body>
</html>
"#
    )
}

/// Bare-bones harness for poking the WebSocket by hand
pub const TEST_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Crackerjack WebSocket Test</title>
    <meta charset="UTF-8">
</head>
<body>
    <h1>WebSocket Test Harness</h1>
    <input id="jobId" placeholder="job id" value="test-job">
    <button onclick="connect()">Connect</button>
    <input id="payload" placeholder="message">
    <button onclick="send()">Send</button>
    <pre id="out"></pre>
    <script>
        let ws = null;
        const out = (line) => {
            document.getElementById('out').textContent += line + '\n';
        };
        function connect() {
            const jobId = document.getElementById('jobId').value;
            ws = new WebSocket(`ws://${location.host}/ws/progress/${jobId}`);
            ws.onopen = () => out('open');
            ws.onclose = (e) => out(`close ${e.code} ${e.reason}`);
            ws.onmessage = (e) => out(`recv ${e.data}`);
        }
        function send() {
            if (ws) ws.send(document.getElementById('payload').value);
        }
    </script>
</body>
</html>
"#;
