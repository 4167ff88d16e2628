use crate::app::{App, Focus};
use crate::catalog::CatalogState;
use pipescope_core::GraphLayout;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{
        canvas::{Canvas, Line as CanvasLine, Rectangle},
        Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap,
    },
};

const SIDEBAR_WIDTH: u16 = 32;
const NAV_HEIGHT: u16 = 5;

#[derive(Clone, Copy)]
struct Theme {
    border: Color,
    focus: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    node: Color,
    edge: Color,
    ok: Color,
    warn: Color,
}

fn theme() -> Theme {
    Theme {
        border: Color::Rgb(71, 85, 105),
        focus: Color::Rgb(56, 189, 248),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(167, 139, 250),
        node: Color::Rgb(96, 165, 250),
        edge: Color::Rgb(100, 116, 139),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
    }
}

struct Areas {
    filter: Rect,
    list: Rect,
    nav: Rect,
    graph: Rect,
    status: Rect,
}

fn split(size: Rect) -> Areas {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(0)])
        .split(size);
    let sidebar = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(columns[0]);
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(NAV_HEIGHT),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(columns[1]);
    Areas {
        filter: sidebar[0],
        list: sidebar[1],
        nav: main[0],
        graph: main[1],
        status: main[2],
    }
}

/// Inner area the graph canvas occupies for a terminal of `size`.
pub fn graph_area(size: Rect) -> Rect {
    Block::default().borders(Borders::ALL).inner(split(size).graph)
}

pub fn render(frame: &mut ratatui::Frame, app: &App) {
    let theme = theme();
    let areas = split(frame.size());
    render_filter(frame, app, theme, areas.filter);
    render_catalog(frame, app, theme, areas.list);
    render_nav(frame, app, theme, areas.nav);
    render_graph(frame, app, theme, areas.graph);
    render_status(frame, app, theme, areas.status);
    if app.help_open {
        render_help_overlay(frame, theme);
    }
}

fn panel_block(title: &str, focused: bool, theme: Theme) -> Block<'static> {
    let border = if focused { theme.focus } else { theme.border };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .title(Span::styled(
            format!(" {title} "),
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn render_filter(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let editing = app.focus == Focus::Filter;
    let text = app.catalog.filter_text();
    let line = if text.is_empty() && !editing {
        Line::from(Span::styled("/ to filter", Style::default().fg(theme.muted)))
    } else {
        let cursor = if editing { "_" } else { "" };
        Line::from(Span::styled(
            format!("{text}{cursor}"),
            Style::default().fg(theme.text),
        ))
    };
    frame.render_widget(
        Paragraph::new(line).block(panel_block("Filter", editing, theme)),
        area,
    );
}

fn render_catalog(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let title = if app.catalog.is_deferred() {
        "Pipelines (waiting for agent)"
    } else if app.catalog.state() == CatalogState::ListPending {
        "Pipelines (loading)"
    } else {
        "Pipelines"
    };
    let selected = app.catalog.selected();
    let items: Vec<ListItem> = app
        .catalog
        .visible_names()
        .into_iter()
        .map(|name| {
            let style = if Some(name) == selected {
                Style::default().fg(theme.accent)
            } else {
                Style::default().fg(theme.text)
            };
            ListItem::new(Line::from(Span::styled(name.to_string(), style)))
        })
        .collect();
    let empty = items.is_empty();
    let list = List::new(items)
        .block(panel_block(title, app.focus == Focus::Catalog, theme))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = ListState::default();
    if !empty {
        state.select(Some(app.catalog.cursor()));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_nav(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let view = &app.view;
    let mut lines = Vec::new();
    lines.push(Line::from(Span::styled(
        view.label()
            .unwrap_or_else(|| "No pipeline selected.".to_string()),
        Style::default().fg(theme.text),
    )));

    let mut selector_spans = Vec::new();
    if let Some(selector) = view.selector() {
        for (idx, entry) in selector.entries().iter().enumerate() {
            let mut style = Style::default().fg(theme.muted);
            if idx == selector.highlighted() {
                style = style.fg(theme.text).add_modifier(Modifier::UNDERLINED);
                if app.focus == Focus::Selector {
                    style = style.add_modifier(Modifier::REVERSED);
                }
            }
            selector_spans.push(Span::styled(format!(" {} ", entry.label()), style));
            selector_spans.push(Span::raw(" "));
        }
    }
    lines.push(Line::from(selector_spans));

    let enabled = |on: bool| {
        if on {
            Style::default().fg(theme.text)
        } else {
            Style::default().fg(theme.muted).add_modifier(Modifier::DIM)
        }
    };
    let (refresh_label, refresh_color) = if view.auto_refresh_active() {
        ("on", theme.ok)
    } else {
        ("off", theme.muted)
    };
    lines.push(Line::from(vec![
        Span::styled("[e] Export", enabled(view.export_enabled())),
        Span::raw("  "),
        Span::styled(
            "[a] Auto-refresh: ",
            enabled(view.auto_refresh_available()),
        ),
        Span::styled(refresh_label, Style::default().fg(refresh_color)),
    ]));

    frame.render_widget(
        Paragraph::new(lines).block(panel_block("Pipeline", app.focus == Focus::Selector, theme)),
        area,
    );
}

fn render_graph(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let block = panel_block("Graph", app.focus == Focus::Graph, theme);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let Some(descriptor) = app.view.descriptor() else {
        frame.render_widget(
            Paragraph::new(Span::styled(
                "Select a pipeline in the sidebar.",
                Style::default().fg(theme.muted),
            )),
            inner,
        );
        return;
    };
    let layout: &GraphLayout = &descriptor.rendered_graph().layout;
    let viewport = app.view.viewport();
    let width = f64::from(inner.width);
    let height = f64::from(inner.height);
    // Layout y grows downwards, canvas y upwards.
    let flip = move |y: f64| height - y;

    let canvas = Canvas::default()
        .marker(Marker::Braille)
        .x_bounds([0.0, width])
        .y_bounds([0.0, height])
        .paint(move |ctx| {
            let scale = viewport.scale;
            for cluster in &layout.clusters {
                let (x, y) = viewport.to_screen(cluster.x, cluster.y);
                let h = cluster.height * scale;
                ctx.draw(&Rectangle {
                    x,
                    y: flip(y + h),
                    width: cluster.width * scale,
                    height: h,
                    color: theme.accent,
                });
                ctx.print(
                    x + 1.0,
                    flip(y + 0.5),
                    Line::styled(cluster.name.clone(), Style::default().fg(theme.accent)),
                );
            }
            ctx.layer();
            for edge in &layout.edges {
                let (x1, y1) = viewport.to_screen(edge.x1, edge.y1);
                let (x2, y2) = viewport.to_screen(edge.x2, edge.y2);
                ctx.draw(&CanvasLine {
                    x1,
                    y1: flip(y1),
                    x2,
                    y2: flip(y2),
                    color: theme.edge,
                });
            }
            ctx.layer();
            for node in &layout.nodes {
                let (x, y) = viewport.to_screen(node.x, node.y);
                let h = node.height * scale;
                ctx.draw(&Rectangle {
                    x,
                    y: flip(y + h),
                    width: node.width * scale,
                    height: h,
                    color: theme.node,
                });
                ctx.print(
                    x + 2.0 * scale,
                    flip(y + h / 2.0),
                    Line::styled(node.label.clone(), Style::default().fg(theme.text)),
                );
            }
        });
    frame.render_widget(canvas, inner);
}

fn render_status(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let (connection, color) = if app.target_available() {
        ("agent ready", theme.ok)
    } else {
        ("agent offline", theme.warn)
    };
    let viewport = app.view.viewport();
    let mut spans = vec![
        Span::styled(format!(" {connection} "), Style::default().fg(color)),
        Span::styled(
            format!(" zoom {:.0}% ", viewport.scale * 100.0),
            Style::default().fg(theme.muted),
        ),
    ];
    if let Some(note) = &app.status_note {
        spans.push(Span::styled(
            format!(" {note} "),
            Style::default().fg(theme.text),
        ));
    }
    spans.push(Span::styled(
        " ? help  q quit ",
        Style::default().fg(theme.muted),
    ));
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn render_help_overlay(frame: &mut ratatui::Frame, theme: Theme) {
    let area = centered_rect(60, 60, frame.size());
    let key = |text: &'static str| Span::styled(text, Style::default().fg(theme.focus));
    let lines = vec![
        Line::from(vec![key("Tab"), Span::raw("  cycle sidebar / bins / graph")]),
        Line::from(vec![key("/"), Span::raw("  filter pipelines (Enter/Esc to finish)")]),
        Line::from(vec![key("Enter"), Span::raw("  open pipeline or chosen bin")]),
        Line::from(vec![key("r"), Span::raw("  reload pipeline list")]),
        Line::from(vec![key("a"), Span::raw("  toggle auto-refresh (1s)")]),
        Line::from(vec![key("e / Ctrl-s"), Span::raw("  export DOT file")]),
        Line::from(vec![
            key("arrows + - 0"),
            Span::raw("  pan, zoom, reset (graph focused)"),
        ]),
        Line::from(vec![key("drag, Alt+wheel"), Span::raw("  pan and zoom with the mouse")]),
        Line::from(vec![key("q"), Span::raw("  quit")]),
    ];
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(panel_block("Help", true, theme)),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
