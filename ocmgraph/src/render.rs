use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::graph::{Dag, DagView, DiscoveryState};

pub const DEFAULT_REFRESH_RATE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Tree,
    List,
    Json,
    Yaml,
    Ndjson,
    Table,
}

impl std::str::FromStr for Format {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "tree" => Ok(Format::Tree),
            "list" => Ok(Format::List),
            "json" => Ok(Format::Json),
            "yaml" => Ok(Format::Yaml),
            "ndjson" => Ok(Format::Ndjson),
            "table" => Ok(Format::Table),
            other => Err(format!("unknown format {other}")),
        }
    }
}

/// Render one frame. The read lock is held for the whole frame, so a frame
/// always sees a consistent snapshot; rendering the same graph twice yields
/// byte-identical output.
pub fn render<K>(dag: &Dag<K>, format: Format) -> String
where
    K: Ord + Clone + std::fmt::Display,
{
    dag.with_read_lock(|view| match format {
        Format::Tree => render_tree(&view),
        Format::List => render_list(&view),
        Format::Json => {
            // to_string on a Value built from ordered keys is deterministic
            serde_json::to_string_pretty(&vertices_json(&view)).unwrap_or_default()
        }
        Format::Yaml => serde_yaml::to_string(&vertices_json(&view)).unwrap_or_default(),
        Format::Ndjson => {
            let mut out = String::new();
            for v in vertices_json(&view) {
                out.push_str(&serde_json::to_string(&v).unwrap_or_default());
                out.push('\n');
            }
            out
        }
        Format::Table => render_table(&view),
    })
}

fn vertices_json<K>(view: &DagView<'_, K>) -> Vec<Value>
where
    K: Ord + Clone + std::fmt::Display,
{
    view.keys()
        .map(|key| {
            let attrs = view.attributes(key).expect("key from the same view");
            let mut children: Vec<String> =
                view.children(key).iter().map(|c| c.to_string()).collect();
            children.sort();
            let mut obj = json!({
                "key": key.to_string(),
                "state": attrs.state.as_str(),
                "children": children,
            });
            if let Some(value) = &attrs.value {
                obj["value"] = value.clone();
            }
            if !attrs.user.is_empty() {
                obj["attributes"] = json!(attrs.user);
            }
            obj
        })
        .collect()
}

fn render_list<K>(view: &DagView<'_, K>) -> String
where
    K: Ord + Clone + std::fmt::Display,
{
    let mut out = String::new();
    for key in view.keys() {
        let state = view
            .attributes(key)
            .map(|a| a.state)
            .unwrap_or(DiscoveryState::Pending);
        out.push_str(&format!("{} {}\n", key, state));
    }
    out
}

fn render_table<K>(view: &DagView<'_, K>) -> String
where
    K: Ord + Clone + std::fmt::Display,
{
    let rows: Vec<(String, &'static str)> = view
        .keys()
        .map(|k| {
            (
                k.to_string(),
                view.attributes(k)
                    .map(|a| a.state.as_str())
                    .unwrap_or("pending"),
            )
        })
        .collect();
    let key_width = std::cmp::max(3, rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0));
    let mut out = format!("{:<key_width$}  STATE\n", "KEY");
    for (key, state) in rows {
        out.push_str(&format!("{:<key_width$}  {}\n", key, state));
    }
    out
}

fn render_tree<K>(view: &DagView<'_, K>) -> String
where
    K: Ord + Clone + std::fmt::Display,
{
    let mut out = String::new();
    let roots = view.roots();
    for root in &roots {
        out.push_str(&format!("{} [{}]\n", root, state_of(view, root)));
        let mut children: Vec<&K> = view.children(root).iter().collect();
        children.sort();
        render_subtree(view, &children, "", &mut out);
    }
    out
}

fn state_of<K>(view: &DagView<'_, K>, key: &K) -> DiscoveryState
where
    K: Ord + Clone + std::fmt::Display,
{
    view.attributes(key)
        .map(|a| a.state)
        .unwrap_or(DiscoveryState::Pending)
}

fn render_subtree<K>(view: &DagView<'_, K>, children: &[&K], prefix: &str, out: &mut String)
where
    K: Ord + Clone + std::fmt::Display,
{
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let branch = if last { "└── " } else { "├── " };
        out.push_str(&format!(
            "{}{}{} [{}]\n",
            prefix,
            branch,
            child,
            state_of(view, child)
        ));
        let mut grandchildren: Vec<&K> = view.children(child).iter().collect();
        grandchildren.sort();
        let next_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
        render_subtree(view, &grandchildren, &next_prefix, out);
    }
}

/// Renders a frame every `refresh_rate`, emitting only when the output
/// changed. On a TTY the previous frame is erased line by line first; when
/// stdout is not a terminal every frame is written fresh.
pub struct LiveRenderer<K: Ord + Clone + std::fmt::Display> {
    dag: Arc<Dag<K>>,
    format: Format,
    refresh_rate: Duration,
    tty: bool,
    last: Option<String>,
}

impl<K: Ord + Clone + std::fmt::Display> LiveRenderer<K> {
    pub fn new(dag: Arc<Dag<K>>, format: Format) -> LiveRenderer<K> {
        LiveRenderer {
            dag,
            format,
            refresh_rate: DEFAULT_REFRESH_RATE,
            tty: false,
            last: None,
        }
    }

    pub fn refresh_rate(mut self, refresh_rate: Duration) -> Self {
        self.refresh_rate = refresh_rate;
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// One frame: render, compare, emit. Returns whether anything was
    /// written.
    pub fn tick(&mut self, out: &mut impl Write) -> std::io::Result<bool> {
        let frame = render(&self.dag, self.format);
        if self.last.as_ref() == Some(&frame) {
            return Ok(false);
        }
        if self.tty && let Some(last) = &self.last {
            // erase exactly the previous frame's lines
            for _ in 0..last.lines().count() {
                out.write_all(b"\x1b[1F\x1b[2K")?;
            }
        }
        out.write_all(frame.as_bytes())?;
        if !frame.ends_with('\n') {
            out.write_all(b"\n")?;
        }
        out.flush()?;
        self.last = Some(frame);
        Ok(true)
    }

    /// Tick until the stop channel flips (or its sender goes away), then
    /// emit a final frame.
    pub async fn run(
        mut self,
        out: &mut (impl Write + Send),
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let mut interval = tokio::time::interval(self.refresh_rate);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(out)?;
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        self.tick(out)?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attributes;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_static_render_deterministic() {
        let dag: Dag<String> = Dag::new();
        for k in ["app", "base", "lib"] {
            dag.add_vertex(key(k), Attributes::default()).unwrap();
        }
        dag.add_edge(&key("app"), &key("base")).unwrap();
        dag.add_edge(&key("app"), &key("lib")).unwrap();

        for format in [
            Format::Tree,
            Format::List,
            Format::Json,
            Format::Yaml,
            Format::Ndjson,
            Format::Table,
        ] {
            assert_eq!(render(&dag, format), render(&dag, format), "{format:?}");
        }
    }

    #[test]
    fn test_tree_shape() {
        let dag: Dag<String> = Dag::new();
        for k in ["a", "b", "c", "d"] {
            dag.add_vertex(key(k), Attributes::default()).unwrap();
        }
        dag.add_edge(&key("a"), &key("b")).unwrap();
        dag.add_edge(&key("a"), &key("d")).unwrap();
        dag.add_edge(&key("b"), &key("c")).unwrap();

        let tree = render(&dag, Format::Tree);
        assert_eq!(
            tree,
            "a [pending]\n\
             ├── b [pending]\n\
             │   └── c [pending]\n\
             └── d [pending]\n"
        );
    }

    #[test]
    fn test_live_frames_grow_and_flip() {
        let dag: Arc<Dag<String>> = Arc::new(Dag::new());
        let mut renderer = LiveRenderer::new(dag.clone(), Format::Json);
        let mut sink = Vec::new();
        let mut frames: Vec<Vec<(String, String)>> = Vec::new();

        let mut snapshot = |renderer: &mut LiveRenderer<String>, sink: &mut Vec<u8>| {
            if renderer.tick(sink).unwrap() {
                let parsed: Vec<Value> =
                    serde_json::from_str(renderer.last.as_ref().unwrap()).unwrap();
                frames.push(
                    parsed
                        .iter()
                        .map(|v| {
                            (
                                v["key"].as_str().unwrap().to_string(),
                                v["state"].as_str().unwrap().to_string(),
                            )
                        })
                        .collect(),
                );
            }
        };

        dag.add_vertex(key("a"), Attributes::default()).unwrap();
        snapshot(&mut renderer, &mut sink);
        dag.add_vertex(key("b"), Attributes::default()).unwrap();
        dag.add_edge(&key("a"), &key("b")).unwrap();
        snapshot(&mut renderer, &mut sink);
        dag.add_vertex(key("c"), Attributes::default()).unwrap();
        dag.add_edge(&key("b"), &key("c")).unwrap();
        snapshot(&mut renderer, &mut sink);
        dag.add_vertex(key("d"), Attributes::default()).unwrap();
        dag.add_edge(&key("a"), &key("d")).unwrap();
        snapshot(&mut renderer, &mut sink);
        // completion in reverse topological order
        for k in ["d", "c", "b", "a"] {
            dag.set_state(&key(k), DiscoveryState::Completed).unwrap();
            snapshot(&mut renderer, &mut sink);
        }

        // the list grows in exactly the mutation order
        let keys: Vec<Vec<&str>> = frames
            .iter()
            .map(|f| f.iter().map(|(k, _)| k.as_str()).collect())
            .collect();
        assert_eq!(keys[0], vec!["a"]);
        assert_eq!(keys[1], vec!["a", "b"]);
        assert_eq!(keys[2], vec!["a", "b", "c"]);
        assert_eq!(keys[3], vec!["a", "b", "c", "d"]);
        // and the states flip to completed bottom-up
        let completed_counts: Vec<usize> = frames[3..]
            .iter()
            .map(|f| f.iter().filter(|(_, s)| s == "completed").count())
            .collect();
        assert_eq!(completed_counts, vec![0, 1, 2, 3, 4]);

        // a tick without mutations emits nothing
        assert!(!renderer.tick(&mut sink).unwrap());
    }

    #[test]
    fn test_tty_erase_sequences() {
        let dag: Arc<Dag<String>> = Arc::new(Dag::new());
        dag.add_vertex(key("a"), Attributes::default()).unwrap();
        let mut renderer = LiveRenderer::new(dag.clone(), Format::List).tty(true);
        let mut sink = Vec::new();
        renderer.tick(&mut sink).unwrap();
        let first_len = sink.len();
        dag.add_vertex(key("b"), Attributes::default()).unwrap();
        renderer.tick(&mut sink).unwrap();
        let output = String::from_utf8(sink.split_off(first_len)).unwrap();
        // one erase for the single previous line
        assert!(output.starts_with("\x1b[1F\x1b[2K"));
        assert!(output.contains("b pending"));
    }
}
