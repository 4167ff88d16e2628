use crossterm::event::{KeyModifiers, MouseButton, MouseEvent, MouseEventKind};

pub const MIN_SCALE: f64 = 0.2;
pub const MAX_SCALE: f64 = 5.0;
pub const ZOOM_STEP: f64 = 1.25;
pub const PAN_STEP: f64 = 4.0;

/// Pan offset (in cells) and zoom factor applied to the laid-out graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale: f64,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale: 1.0,
        }
    }
}

impl ViewportState {
    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.offset_x += dx;
        self.offset_y += dy;
    }

    /// Zoom by `factor`, keeping the graph point under `(anchor_x, anchor_y)`
    /// fixed on screen.
    pub fn zoom_about(&mut self, factor: f64, anchor_x: f64, anchor_y: f64) {
        let scale = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        let graph_x = (anchor_x - self.offset_x) / self.scale;
        let graph_y = (anchor_y - self.offset_y) / self.scale;
        self.offset_x = anchor_x - graph_x * scale;
        self.offset_y = anchor_y - graph_y * scale;
        self.scale = scale;
    }

    pub fn to_screen(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale + self.offset_x,
            y * self.scale + self.offset_y,
        )
    }
}

/// Turns mouse and keyboard input on the graph into viewport transforms.
/// A fresh controller is built for every displayed graph.
#[derive(Debug, Clone, Default)]
pub struct PanZoomController {
    viewport: ViewportState,
    drag_from: Option<(u16, u16)>,
}

impl PanZoomController {
    pub fn new(viewport: ViewportState) -> Self {
        Self {
            viewport,
            drag_from: None,
        }
    }

    pub fn viewport(&self) -> ViewportState {
        self.viewport
    }

    /// Apply a mouse event whose coordinates are relative to the graph
    /// area. Returns true when the viewport changed.
    pub fn handle_mouse(&mut self, event: &MouseEvent) -> bool {
        match event.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                self.drag_from = Some((event.column, event.row));
                false
            }
            MouseEventKind::Drag(MouseButton::Left) => {
                let Some((column, row)) = self.drag_from else {
                    return false;
                };
                self.drag_from = Some((event.column, event.row));
                self.viewport.pan(
                    f64::from(event.column) - f64::from(column),
                    f64::from(event.row) - f64::from(row),
                );
                true
            }
            MouseEventKind::Up(MouseButton::Left) => {
                self.drag_from = None;
                false
            }
            MouseEventKind::ScrollUp | MouseEventKind::ScrollDown => {
                // Plain wheel scrolls belong to the panel, not the graph.
                if !event.modifiers.contains(KeyModifiers::ALT) {
                    return false;
                }
                let factor = if event.kind == MouseEventKind::ScrollUp {
                    ZOOM_STEP
                } else {
                    1.0 / ZOOM_STEP
                };
                self.viewport
                    .zoom_about(factor, f64::from(event.column), f64::from(event.row));
                true
            }
            _ => false,
        }
    }

    pub fn pan(&mut self, dx: f64, dy: f64) -> bool {
        self.viewport.pan(dx, dy);
        true
    }

    /// Zoom about the centre of a `width` x `height` graph area.
    pub fn zoom(&mut self, factor: f64, width: u16, height: u16) -> bool {
        let before = self.viewport.scale;
        self.viewport
            .zoom_about(factor, f64::from(width) / 2.0, f64::from(height) / 2.0);
        self.viewport.scale != before
    }

    pub fn reset(&mut self) -> bool {
        self.viewport = ViewportState::default();
        true
    }
}
