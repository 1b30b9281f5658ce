use anyhow::*;
use identity_hash::IntMap;
use std::io::Write;
use std::path::Path;

use crate::dataset::Datatype;
use crate::delimit::{CollapseRecord, Taxon};
use crate::tree::{NodeID, PhyloTree};
use crate::tree_info::TreeInfo;
use crate::utils::{create_file, xml_escape};

#[derive(Debug, Clone)]
pub struct VisualStyle {
    pub highlight: String,
    pub background: Vec<String>,
    pub outgroup_color: String,
    pub font_size: f64,
    pub font: String,
    pub bootstrap_cutoff: f64,
    /// Height of a collapsed triangle per leaf it stands for
    pub height_multiplier: f64,
    /// Characters per line of accession lists
    pub max_word_length: usize,
    pub full_genus: bool,
    /// Pixels per substitution/site
    pub scale: f64,
    pub margin: f64,
}
impl Default for VisualStyle {
    fn default() -> Self {
        VisualStyle {
            highlight: "#bb0000".into(),
            background: vec!["#f4f4f4".into(), "#c6c6c6".into()],
            outgroup_color: "#999999".into(),
            font_size: 10.,
            font: "Arial".into(),
            bootstrap_cutoff: 70.,
            height_multiplier: 6.,
            max_word_length: 48,
            full_genus: false,
            scale: 1000.,
            margin: 200.,
        }
    }
}
impl VisualStyle {
    fn row(&self) -> f64 {
        self.font_size * 1.6
    }
}

struct Layout {
    x: IntMap<NodeID, f64>,
    y: IntMap<NodeID, f64>,
    /// Nodes drawn as terminals, in drawing order
    terminals: Vec<NodeID>,
    height: f64,
    width: f64,
}

fn layout(tree: &PhyloTree, style: &VisualStyle, row_of: &dyn Fn(NodeID) -> Option<f64>) -> Layout {
    fn rec(
        tree: &PhyloTree,
        n: NodeID,
        x: f64,
        style: &VisualStyle,
        row_of: &dyn Fn(NodeID) -> Option<f64>,
        cursor: &mut f64,
        l: &mut Layout,
    ) {
        l.x.insert(n, x);
        l.width = l.width.max(x);
        if let Some(row) = row_of(n).or_else(|| tree[n].is_leaf().then(|| style.row())) {
            l.y.insert(n, *cursor + row / 2.);
            *cursor += row;
            l.terminals.push(n);
        } else {
            let children = tree[n].children();
            for &c in children {
                rec(tree, c, x + tree[c].dist * style.scale, style, row_of, cursor, l);
            }
            let first = l.y[&children[0]];
            let last = l.y[&children[children.len() - 1]];
            l.y.insert(n, (first + last) / 2.);
        }
    }

    let mut l = Layout { x: IntMap::default(), y: IntMap::default(), terminals: Vec::new(), height: 0., width: 0. };
    let mut cursor = style.margin;
    rec(tree, tree.root(), style.margin, style, row_of, &mut cursor, &mut l);
    l.height = cursor + style.margin;
    l
}

fn header(out: &mut dyn Write, width: f64, height: f64, style: &VisualStyle) -> Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
    writeln!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{:.0}" height="{:.0}" font-family="{}" font-size="{}">"#,
        width, height, style.font, style.font_size
    )?;
    writeln!(out, r#"<rect x="0" y="0" width="{:.0}" height="{:.0}" fill="white"/>"#, width, height)?;
    Ok(())
}

fn edges(out: &mut dyn Write, tree: &PhyloTree, l: &Layout, is_terminal: &dyn Fn(NodeID) -> bool) -> Result<()> {
    let mut todo = vec![tree.root()];
    while let Some(n) = todo.pop() {
        if is_terminal(n) {
            continue;
        }
        let children = tree[n].children();
        if children.is_empty() {
            continue;
        }
        let (x, y0, y1) = (l.x[&n], l.y[&children[0]], l.y[&children[children.len() - 1]]);
        writeln!(out, r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="black"/>"#, x, y0, x, y1)?;
        for &c in children {
            writeln!(
                out,
                r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="black"/>"#,
                x,
                l.y[&c],
                l.x[&c],
                l.y[&c]
            )?;
            todo.push(c);
        }
    }
    Ok(())
}

fn supports(out: &mut dyn Write, tree: &PhyloTree, l: &Layout, style: &VisualStyle, is_terminal: &dyn Fn(NodeID) -> bool) -> Result<()> {
    for &n in l.x.keys() {
        if n == tree.root() || tree[n].is_leaf() || is_terminal(n) {
            continue;
        }
        if tree[n].support > style.bootstrap_cutoff {
            writeln!(
                out,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end" font-size="{}">{}</text>"#,
                l.x[&n] - 2.,
                l.y[&n] - 3.,
                style.font_size * 0.8,
                tree[n].support as i64
            )?;
        }
    }
    Ok(())
}

/// Draws a rectangular phylogram with every leaf name.
pub fn render_tree<P: AsRef<Path>>(tree: &PhyloTree, filename: P, style: &VisualStyle) -> Result<()> {
    let leaf_row = |n: NodeID| if tree[n].is_leaf() { Some(style.row()) } else { None };
    let l = layout(tree, style, &leaf_row);
    let longest = l.terminals.iter().map(|&n| tree[n].name.len()).max().unwrap_or(0) as f64;
    let width = l.width + longest * style.font_size + style.margin;

    let mut out = create_file(filename)?;
    header(&mut out, width, l.height, style)?;
    edges(&mut out, tree, &l, &|_| false)?;
    supports(&mut out, tree, &l, style, &|_| false)?;
    for &n in l.terminals.iter() {
        writeln!(
            out,
            r#"<text x="{:.1}" y="{:.1}">{}</text>"#,
            l.x[&n] + 4.,
            l.y[&n] + style.font_size / 3.,
            xml_escape(&tree[n].name)
        )?;
    }
    writeln!(out, "</svg>")?;
    Ok(out.flush()?)
}

/// Splits a comma-separated list in lines of about `max_len` characters.
fn divide_by_max_len(words: &[(String, bool)], max_len: usize) -> Vec<Vec<(String, bool)>> {
    let mut r = vec![Vec::new()];
    let mut current = 0;
    for w in words {
        if current >= max_len {
            r.push(Vec::new());
            current = 0;
        }
        current += w.0.len() + 2;
        if let Some(line) = r.last_mut() {
            line.push(w.clone());
        }
    }
    r
}

fn taxon_tspans(taxon: &Taxon, index: Option<usize>, style: &VisualStyle) -> String {
    let mut r = String::new();
    if !taxon.genus.is_empty() {
        let genus = if style.full_genus {
            taxon.genus.clone()
        } else {
            format!("{}.", taxon.genus.chars().next().unwrap_or(' '))
        };
        r.push_str(&format!(r#"<tspan font-style="italic">{} </tspan>"#, xml_escape(&genus)));
    }
    if !taxon.species.is_empty() {
        let italic = !taxon.is_placeholder() && taxon.species.parse::<i64>().is_err();
        r.push_str(&format!(
            r#"<tspan{}>{} </tspan>"#,
            if italic { r#" font-style="italic""# } else { "" },
            xml_escape(&taxon.species)
        ));
    }
    if let Some(i) = index {
        r.push_str(&format!("<tspan>{}</tspan>", i));
    }
    r
}

/// Draws the tree with every collapsed clade reduced to a triangle and its taxon.
pub fn render_collapsed<P: AsRef<Path>>(info: &TreeInfo, filename: P, style: &VisualStyle) -> Result<()> {
    let tree = &info.tree;
    let mut collapsed: IntMap<NodeID, (&Taxon, Option<usize>, &CollapseRecord)> = IntMap::default();
    for (taxon, records) in info.collapse_dict.iter() {
        for (i, record) in records.iter().enumerate() {
            let index = if records.len() > 1 { Some(i + 1) } else { None };
            collapsed.insert(record.clade, (taxon, index, record));
        }
    }

    let accession_lines = |record: &CollapseRecord| {
        let mut ids = record
            .leaves
            .iter()
            .map(|leaf| {
                let id = info.meta.get(&leaf.hash).map(|m| m.original_id.clone()).unwrap_or_else(|| leaf.hash.clone());
                (id, leaf.datatype == Some(Datatype::Query))
            })
            .collect::<Vec<_>>();
        ids.sort();
        divide_by_max_len(&ids, style.max_word_length)
    };
    let row_of = |n: NodeID| {
        collapsed.get(&n).map(|(_, _, record)| {
            let triangle = record.leaves.len() as f64 * style.height_multiplier;
            let text = accession_lines(record).len() as f64 * style.row();
            triangle.max(text).max(style.row()) + 4.
        })
    };
    let l = layout(tree, style, &row_of);
    let is_terminal = |n: NodeID| collapsed.contains_key(&n);

    let mut out = create_file(filename)?;
    header(&mut out, l.width + 800. + style.margin, l.height, style)?;

    let mut bgstate = 0;
    for &n in l.terminals.iter() {
        let (_, _, record) = collapsed[&n];
        let names = record.leaves.iter().map(|leaf| leaf.hash.as_str()).collect::<Vec<_>>();
        let outgroup_only = names.iter().any(|h| info.outgroup_leaves.iter().any(|o| o == h))
            && names.iter().all(|h| info.outgroup_leaves.iter().any(|o| o == h) || info.query.contains(*h));
        let bg = if outgroup_only {
            style.outgroup_color.clone()
        } else {
            bgstate += 1;
            style.background[(bgstate - 1) % style.background.len().max(1)].clone()
        };
        let height = row_of(n).unwrap_or_else(|| style.row());
        writeln!(
            out,
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}"/>"#,
            l.x[&n],
            l.y[&n] - height / 2.,
            l.width - l.x[&n] + 800.,
            height,
            bg
        )?;
    }

    edges(&mut out, tree, &l, &is_terminal)?;
    supports(&mut out, tree, &l, style, &is_terminal)?;

    for &n in l.terminals.iter() {
        let (taxon, index, record) = collapsed[&n];
        let color = if record.n_query > 0 { style.highlight.as_str() } else { "#000000" };
        let (x, y) = (l.x[&n], l.y[&n]);
        let mut text_x = x + 8.;
        if record.leaves.len() > 1 {
            let width = tree.max_leaf_distance(n) * style.scale;
            let half = record.leaves.len() as f64 * style.height_multiplier / 2.;
            writeln!(
                out,
                r#"<polygon points="{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="{}"/>"#,
                x,
                y,
                x + width,
                y - half,
                x + width,
                y + half,
                color
            )?;
            text_x += width;
        }

        writeln!(
            out,
            r#"<text x="{:.1}" y="{:.1}" fill="{}">{}</text>"#,
            text_x,
            y + style.font_size / 3.,
            color,
            taxon_tspans(taxon, index, style)
        )?;

        let lines = accession_lines(record);
        let top = y - (lines.len() as f64 - 1.) * style.row() / 2.;
        let accession_x = text_x + (taxon.to_string().len() as f64 + 4.) * style.font_size * 0.6;
        for (k, line) in lines.iter().enumerate() {
            let spans = line
                .iter()
                .map(|(id, query)| {
                    format!(
                        "<tspan{}>{}  </tspan>",
                        if *query { format!(r#" fill="{}""#, style.highlight) } else { String::new() },
                        xml_escape(id)
                    )
                })
                .collect::<String>();
            writeln!(
                out,
                r#"<text x="{:.1}" y="{:.1}">{}</text>"#,
                accession_x,
                top + k as f64 * style.row() + style.font_size / 3.,
                spans
            )?;
        }
    }
    writeln!(out, "</svg>")?;
    Ok(out.flush()?)
}
