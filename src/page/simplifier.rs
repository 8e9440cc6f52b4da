//! Reduces a DOM snapshot to the markup an AI-assisted locator gets to see.
//!
//! The output is deterministic and stable under re-simplification: feeding
//! the result back in yields the same string.

use scraper::{ElementRef, Html};
use std::fmt::{self, Write as _};
use url::Url;

pub const DEFAULT_MAX_BYTES: usize = 16_384;

const STRIPPED_TAGS: &[&str] = &[
    "meta", "link", "script", "style", "iframe", "video", "audio", "canvas", "footer", "svg",
];

const INTERACTIVE_TAGS: &[&str] = &["input", "textarea", "select", "button", "a"];

const STRUCTURAL_TAGS: &[&str] = &["html", "head", "body"];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

const PRESENTATION_ATTRIBUTES: &[&str] = &[
    "style", "class", "tabindex", "width", "height", "align", "valign", "bgcolor", "background", "border",
    "color", "face", "cellpadding", "cellspacing", "nowrap", "frameborder", "loading", "decoding", "srcset",
    "sizes", "crossorigin", "integrity", "referrerpolicy", "dir", "translate", "spellcheck", "draggable",
    "autocapitalize", "nonce", "slot", "part", "jsaction", "jscontroller", "jsname",
];

const URL_ATTRIBUTES: &[&str] = &["href", "src", "action"];

/// Simplifies `html` to at most `max_bytes` bytes where pruning allows it
///
/// Never fails: if pretty-printing fails the compact rendering of the
/// already-pruned tree is returned.
pub fn simplify(html: &str, base_uri: &str, max_bytes: usize) -> String {
    let base = Url::parse(base_uri).ok();
    let document = Html::parse_document(html);
    let mut tree = Tree::build(&document, base.as_ref());
    drop(document);

    tree.prune_empty();
    tree.truncate(max_bytes);

    tree.render_pretty().unwrap_or_else(|_| tree.render_compact())
}

#[derive(Debug)]
enum Kind {
    Element { name: String, attrs: Vec<(String, String)> },
    Text(String),
}

#[derive(Debug)]
struct Node {
    kind: Kind,
    parent: Option<usize>,
    children: Vec<usize>,
}

enum Step {
    Enter(usize, usize),
    Exit(usize, usize),
}

/// Owned arena copy of the document; index 0 is `<html>`
#[derive(Debug)]
struct Tree {
    nodes: Vec<Node>,
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_stripped(element: ElementRef<'_>) -> bool {
    let value = element.value();
    STRIPPED_TAGS.contains(&value.name()) || value.attr("hidden").is_some()
}

fn keep_attribute(name: &str) -> bool {
    if name == "data-testid" {
        return true;
    }
    !(PRESENTATION_ATTRIBUTES.contains(&name)
        || name.starts_with("aria-")
        || name.starts_with("data-")
        || (name.starts_with("on") && name != "open"))
}

fn absolutize(value: &str, base: Option<&Url>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.starts_with("data:") {
        return None;
    }
    if trimmed.starts_with('#') || trimmed.starts_with("javascript:") {
        return Some(trimmed.to_string());
    }
    Some(match base.and_then(|b| b.join(trimmed).ok()) {
        Some(url) => url.to_string(),
        None => trimmed.to_string(),
    })
}

fn element_kind(element: ElementRef<'_>, base: Option<&Url>) -> Kind {
    let value = element.value();
    let mut attrs: Vec<(String, String)> = value
        .attrs()
        .filter(|(name, _)| keep_attribute(name))
        .filter_map(|(name, v)| {
            if URL_ATTRIBUTES.contains(&name) {
                absolutize(v, base).map(|v| (name.to_string(), v))
            } else {
                Some((name.to_string(), v.to_string()))
            }
        })
        .collect();
    attrs.sort();

    Kind::Element {
        name: value.name().to_string(),
        attrs,
    }
}

impl Tree {
    fn build(document: &Html, base: Option<&Url>) -> Self {
        let mut tree = Tree { nodes: Vec::new() };
        let root_element = document.root_element();
        let root = tree.push(element_kind(root_element, base), None);

        let mut stack = vec![(root_element, root)];
        while let Some((element, index)) = stack.pop() {
            let mut pending = Vec::new();
            for child in element.children() {
                if let Some(child_element) = ElementRef::wrap(child) {
                    if is_stripped(child_element) {
                        continue;
                    }
                    let child_index = tree.push(element_kind(child_element, base), Some(index));
                    pending.push((child_element, child_index));
                } else if let Some(text) = child.value().as_text() {
                    let collapsed = collapse_whitespace(text);
                    if !collapsed.is_empty() {
                        tree.push(Kind::Text(collapsed), Some(index));
                    }
                }
            }
            stack.extend(pending.into_iter().rev());
        }

        tree
    }

    fn push(&mut self, kind: Kind, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
        index
    }

    fn tag(&self, index: usize) -> Option<&str> {
        match &self.nodes[index].kind {
            Kind::Element { name, .. } => Some(name.as_str()),
            Kind::Text(_) => None,
        }
    }

    fn is_structural(&self, index: usize) -> bool {
        self.tag(index).is_some_and(|t| STRUCTURAL_TAGS.contains(&t))
    }

    fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            order.push(index);
            stack.extend(self.nodes[index].children.iter().rev());
        }
        order
    }

    /// Drops elements with no text and no interactive element in their subtree
    ///
    /// Content only ever propagates upward, so one bottom-up pass reaches
    /// the fixed point.
    fn prune_empty(&mut self) {
        let order = self.preorder();
        let mut has_content = vec![false; self.nodes.len()];

        for &index in order.iter().rev() {
            has_content[index] = match &self.nodes[index].kind {
                Kind::Text(_) => true,
                Kind::Element { name, .. } => {
                    INTERACTIVE_TAGS.contains(&name.as_str())
                        || self.nodes[index].children.iter().any(|&c| has_content[c])
                }
            };
        }

        for &index in &order {
            let kept: Vec<usize> = self.nodes[index]
                .children
                .iter()
                .copied()
                .filter(|&c| has_content[c] || self.is_structural(c))
                .collect();
            self.nodes[index].children = kept;
        }
    }

    fn depth(&self, mut index: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[index].parent {
            depth += 1;
            index = parent;
        }
        depth
    }

    /// Last node in document order that may be removed
    fn last_removable(&self) -> Option<usize> {
        for &start in self.nodes[0].children.iter().rev() {
            let mut current = start;
            while let Some(&last) = self.nodes[current].children.last() {
                current = last;
            }
            if !self.is_structural(current) {
                return Some(current);
            }
        }
        None
    }

    /// Removes trailing nodes until the rendering fits in `max_bytes`
    fn truncate(&mut self, max_bytes: usize) {
        let mut size = self.rendered_len(0, 0);

        while size > max_bytes {
            let Some(mut target) = self.last_removable() else {
                break;
            };

            // Collapse ancestors that would be left without children
            while let Some(parent) = self.nodes[target].parent {
                if self.is_structural(parent) || self.nodes[parent].children.len() != 1 {
                    break;
                }
                target = parent;
            }

            size -= self.rendered_len(target, self.depth(target));
            if let Some(parent) = self.nodes[target].parent {
                self.nodes[parent].children.retain(|&c| c != target);
            }
        }
    }

    fn rendered_len(&self, index: usize, depth: usize) -> usize {
        let mut out = String::new();
        match self.write_pretty(index, depth, &mut out) {
            Ok(()) => out.len(),
            Err(_) => {
                out.clear();
                self.write_compact(index, &mut out);
                out.len()
            }
        }
    }

    fn render_pretty(&self) -> Result<String, fmt::Error> {
        let mut out = String::new();
        self.write_pretty(0, 0, &mut out)?;
        Ok(out)
    }

    fn render_compact(&self) -> String {
        let mut out = String::new();
        self.write_compact(0, &mut out);
        out
    }

    fn write_open_tag(out: &mut String, name: &str, attrs: &[(String, String)]) -> fmt::Result {
        write!(out, "<{}", name)?;
        for (key, value) in attrs {
            write!(out, " {}=\"{}\"", key, html_escape::encode_double_quoted_attribute(value))?;
        }
        out.write_char('>')
    }

    /// One node per line, two-space indent; non-void elements always get a closing line
    fn write_pretty(&self, start: usize, depth: usize, out: &mut String) -> fmt::Result {
        let mut stack = vec![Step::Enter(start, depth)];

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(index, depth) => {
                    write!(out, "{:width$}", "", width = depth * 2)?;
                    match &self.nodes[index].kind {
                        Kind::Text(text) => writeln!(out, "{}", html_escape::encode_text(text))?,
                        Kind::Element { name, attrs } => {
                            Self::write_open_tag(out, name, attrs)?;
                            out.write_char('\n')?;
                            if !VOID_TAGS.contains(&name.as_str()) {
                                stack.push(Step::Exit(index, depth));
                                for &child in self.nodes[index].children.iter().rev() {
                                    stack.push(Step::Enter(child, depth + 1));
                                }
                            }
                        }
                    }
                }
                Step::Exit(index, depth) => {
                    if let Kind::Element { name, .. } = &self.nodes[index].kind {
                        writeln!(out, "{:width$}</{}>", "", name, width = depth * 2)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn write_compact(&self, start: usize, out: &mut String) {
        let mut stack = vec![Step::Enter(start, 0)];

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(index, _) => match &self.nodes[index].kind {
                    Kind::Text(text) => out.push_str(&html_escape::encode_text(text)),
                    Kind::Element { name, attrs } => {
                        out.push('<');
                        out.push_str(name);
                        for (key, value) in attrs {
                            out.push(' ');
                            out.push_str(key);
                            out.push_str("=\"");
                            out.push_str(&html_escape::encode_double_quoted_attribute(value));
                            out.push('"');
                        }
                        out.push('>');
                        if !VOID_TAGS.contains(&name.as_str()) {
                            stack.push(Step::Exit(index, 0));
                            for &child in self.nodes[index].children.iter().rev() {
                                stack.push(Step::Enter(child, 0));
                            }
                        }
                    }
                },
                Step::Exit(index, _) => {
                    if let Kind::Element { name, .. } = &self.nodes[index].kind {
                        out.push_str("</");
                        out.push_str(name);
                        out.push('>');
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8"><title>Shop</title>
  <script>var tracking = 1;</script><style>.x{}</style>
  <link rel="stylesheet" href="/s.css">
</head>
<body class="home" style="margin:0">
  <div class="wrapper"><div><span>   </span></div></div>
  <nav aria-label="main" data-track="1" data-testid="nav">
    <a href="/products?page=2" onclick="go()" class="btn">Next   page</a>
  </nav>
  <div hidden><p>secret</p></div>
  <form action="search"><input name="q" tabindex="1" placeholder="Search"></form>
  <img src="data:image/png;base64,AAAA" alt="">
  <footer>Copyright</footer>
</body>
</html>"#;

    #[test]
    fn test_strips_noise_and_absolutizes() {
        let out = simplify(PAGE, "https://shop.test/catalog/", DEFAULT_MAX_BYTES);

        assert!(out.contains("<title>"));
        assert!(out.contains("Shop"));
        assert!(!out.contains("tracking"));
        assert!(!out.contains("stylesheet"));
        assert!(!out.contains("secret"));
        assert!(!out.contains("Copyright"));
        assert!(!out.contains("class="));
        assert!(!out.contains("style="));
        assert!(!out.contains("aria-label"));
        assert!(!out.contains("onclick"));
        assert!(!out.contains("tabindex"));
        assert!(!out.contains("<img"));
        assert!(!out.contains("wrapper"));
        assert!(!out.contains("<span"));
        assert!(out.contains(r#"data-testid="nav""#));
        assert!(out.contains(r#"href="https://shop.test/products?page=2""#));
        assert!(out.contains(r#"action="https://shop.test/catalog/search""#));
        assert!(out.contains(r#"<input name="q" placeholder="Search">"#));
        assert!(out.contains("Next page"));
    }

    #[test]
    fn test_idempotent() {
        let once = simplify(PAGE, "https://shop.test/", DEFAULT_MAX_BYTES);
        let twice = simplify(&once, "https://shop.test/", DEFAULT_MAX_BYTES);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_truncates_from_the_end() {
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("<p>Paragraph number {}</p>", i));
        }
        let html = format!("<html><head><title>T</title></head><body>{}</body></html>", body);

        let full = simplify(&html, "https://x.test/", usize::MAX);
        let budget = full.len() / 3;
        let out = simplify(&html, "https://x.test/", budget);

        assert!(out.len() <= budget);
        assert!(out.contains("Paragraph number 0"));
        assert!(!out.contains("Paragraph number 199"));
        assert!(out.contains("</body>"));
        assert_eq!(simplify(&out, "https://x.test/", budget), out);
    }

    #[test]
    fn test_tiny_budget_keeps_skeleton() {
        let out = simplify(PAGE, "https://shop.test/", 1);
        assert_eq!(out, "<html>\n  <head>\n  </head>\n  <body>\n  </body>\n</html>\n");
    }

    #[test]
    fn test_escapes_text_and_attributes() {
        let html = r#"<body><button title="a &quot;b&quot;">1 &lt; 2 &amp; 3</button></body>"#;
        let out = simplify(html, "not a url", DEFAULT_MAX_BYTES);
        assert!(out.contains("1 &lt; 2 &amp; 3"));
        assert!(out.contains(r#"title="a &quot;b&quot;""#));
        assert_eq!(simplify(&out, "not a url", DEFAULT_MAX_BYTES), out);
    }
}
