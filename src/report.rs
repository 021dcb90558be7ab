//! Post-run result tree rendering.
//!
//! Walks an executed plan and produces the operator-facing summary: one
//! branch per composition primitive (`groups`, `workspaces`, `next`),
//! empty branches omitted, each job leaf formatted by its `report()`.
//! Rendering is a pure function of plan shape and final labels, so calling
//! it twice yields identical output.

use crate::job::Job;
use crate::plan::Plan;

/// Render the result tree for `plan`, rooted at the plan's name.
pub fn render<J: Job>(plan: &Plan<J>) -> String {
    let mut out = String::new();
    out.push_str(&plan.name);
    out.push('\n');
    let children = branches(plan);
    draw(&children, "", &mut out);
    out
}

struct Node {
    label: String,
    children: Vec<Node>,
}

fn branches<J: Job>(plan: &Plan<J>) -> Vec<Node> {
    let mut children = Vec::new();
    if !plan.group.is_empty() {
        children.push(Node {
            label: "groups".to_string(),
            children: plan
                .group
                .iter()
                .map(|child| Node {
                    label: child.name.clone(),
                    children: branches(child),
                })
                .collect(),
        });
    }
    if !plan.jobs.is_empty() {
        children.push(Node {
            label: "workspaces".to_string(),
            children: plan
                .jobs
                .iter()
                .map(|job| Node {
                    label: job.report(),
                    children: Vec::new(),
                })
                .collect(),
        });
    }
    if let Some(next) = &plan.next {
        children.push(Node {
            label: "next".to_string(),
            children: branches(next),
        });
    }
    children
}

fn draw(nodes: &[Node], prefix: &str, out: &mut String) {
    for (i, node) in nodes.iter().enumerate() {
        let last = i == nodes.len() - 1;
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&node.label);
        out.push('\n');
        if !node.children.is_empty() {
            let deeper = format!("{}{}", prefix, if last { "    " } else { "│   " });
            draw(&node.children, &deeper, out);
        }
    }
}
