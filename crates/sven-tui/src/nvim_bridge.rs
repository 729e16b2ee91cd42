use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nvim_rs::{
    compat::tokio::Compat,
    create::tokio as create,
    exttypes::Buffer,
    Handler, Neovim,
    uioptions::UiAttachOptions,
};
use ratatui::{
    style::{Color, Modifier, Style},
    text::{Line, Span},
};
use rmpv::Value;
use tokio::{
    process::{Child, ChildStdin, Command},
    sync::Mutex,
};
use tracing::debug;

/// A single cell in the Neovim grid
#[derive(Debug, Clone)]
pub struct Cell {
    pub text: String,
    pub attr_id: u64,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            text: " ".to_string(),
            attr_id: 0,
        }
    }
}

/// 2D grid representing the Neovim screen
#[derive(Debug, Clone)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<Vec<Cell>>,
}

impl Grid {
    pub fn new(width: usize, height: usize) -> Self {
        let cells = vec![vec![Cell::default(); width]; height];
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.cells = vec![vec![Cell::default(); width]; height];
    }

    pub fn clear(&mut self) {
        for row in &mut self.cells {
            for cell in row {
                *cell = Cell::default();
            }
        }
    }

    pub fn set_cell(&mut self, row: usize, col: usize, cell: Cell) {
        if row < self.height && col < self.width {
            self.cells[row][col] = cell;
        }
    }

    /// Apply a `grid_scroll` redraw event.
    ///
    /// The region `[top, bot) × [left, right)` is scrolled by `rows` rows:
    /// - `rows > 0`: content moves **up** — lines `[top, top+rows)` are
    ///   discarded; lines `[top+rows, bot)` shift to `[top, bot-rows)`;
    ///   the now-empty rows at the bottom are cleared.
    /// - `rows < 0`: content moves **down** — lines `[bot+rows, bot)` are
    ///   discarded; lines `[top, bot+rows)` shift to `[top+|rows|, bot)`;
    ///   the now-empty rows at the top are cleared.
    ///
    /// Neovim will subsequently send `grid_line` events to fill the cleared
    /// (invalidated) rows with new content.
    pub fn scroll(&mut self, top: usize, bot: usize, left: usize, right: usize, rows: i64) {
        if rows == 0 {
            return;
        }
        let right = right.min(self.width);
        let bot   = bot.min(self.height);

        if rows > 0 {
            let count = rows as usize;
            // Shift rows upward: source [top+count, bot) → dest [top, bot-count)
            for r in top..bot.saturating_sub(count) {
                for c in left..right {
                    let src = self.cells[r + count][c].clone();
                    self.cells[r][c] = src;
                }
            }
            // Clear the now-invalid rows at the bottom of the region
            for r in bot.saturating_sub(count)..bot {
                for c in left..right {
                    self.cells[r][c] = Cell::default();
                }
            }
        } else {
            let count = (-rows) as usize;
            // Shift rows downward: source [top, bot-count) → dest [top+count, bot)
            // Iterate in reverse so we don't overwrite source rows before reading them
            for r in (top + count..bot).rev() {
                for c in left..right {
                    let src = self.cells[r - count][c].clone();
                    self.cells[r][c] = src;
                }
            }
            // Clear the now-invalid rows at the top of the region
            let clear_end = (top + count).min(bot);
            for r in top..clear_end {
                for c in left..right {
                    self.cells[r][c] = Cell::default();
                }
            }
        }
    }
}

/// Highlight attributes from Neovim
#[derive(Debug, Clone, Default)]
pub struct HlAttr {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub reverse: bool,
}

impl HlAttr {
    pub fn to_style(&self) -> Style {
        let mut style = Style::default();
        
        if let Some(fg) = self.foreground {
            style = style.fg(fg);
        }
        if let Some(bg) = self.background {
            style = style.bg(bg);
        }
        if self.bold {
            style = style.add_modifier(Modifier::BOLD);
        }
        if self.italic {
            style = style.add_modifier(Modifier::ITALIC);
        }
        if self.underline {
            style = style.add_modifier(Modifier::UNDERLINED);
        }
        if self.reverse {
            style = style.add_modifier(Modifier::REVERSED);
        }
        
        style
    }

    fn from_map(map: &HashMap<String, Value>) -> Self {
        let mut attr = HlAttr::default();

        // Extract foreground color
        if let Some(Value::Integer(fg)) = map.get("foreground") {
            if let Ok(fg_u32) = u32::try_from(fg.as_u64().unwrap_or(0)) {
                let r = ((fg_u32 >> 16) & 0xFF) as u8;
                let g = ((fg_u32 >> 8) & 0xFF) as u8;
                let b = (fg_u32 & 0xFF) as u8;
                attr.foreground = Some(Color::Rgb(r, g, b));
            }
        }

        // Extract background color
        if let Some(Value::Integer(bg)) = map.get("background") {
            if let Ok(bg_u32) = u32::try_from(bg.as_u64().unwrap_or(0)) {
                let r = ((bg_u32 >> 16) & 0xFF) as u8;
                let g = ((bg_u32 >> 8) & 0xFF) as u8;
                let b = (bg_u32 & 0xFF) as u8;
                attr.background = Some(Color::Rgb(r, g, b));
            }
        }

        // Extract style flags
        if let Some(Value::Boolean(true)) = map.get("bold") {
            attr.bold = true;
        }
        if let Some(Value::Boolean(true)) = map.get("italic") {
            attr.italic = true;
        }
        if let Some(Value::Boolean(true)) = map.get("underline") {
            attr.underline = true;
        }
        if let Some(Value::Boolean(true)) = map.get("reverse") {
            attr.reverse = true;
        }

        attr
    }
}

/// Handler for Neovim RPC notifications (redraw events)
#[derive(Clone)]
pub struct NvimHandler {
    grid: Arc<Mutex<Grid>>,
    hl_attrs: Arc<Mutex<HashMap<u64, HlAttr>>>,
    cursor_pos: Arc<Mutex<(u16, u16)>>,
}

impl NvimHandler {
    pub fn new(
        grid: Arc<Mutex<Grid>>,
        hl_attrs: Arc<Mutex<HashMap<u64, HlAttr>>>,
        cursor_pos: Arc<Mutex<(u16, u16)>>,
    ) -> Self {
        Self {
            grid,
            hl_attrs,
            cursor_pos,
        }
    }

    async fn handle_redraw_event(&self, event_name: &str, args: &[Value]) {
        match event_name {
            "grid_resize"      => self.handle_grid_resize(args).await,
            "grid_clear"       => self.handle_grid_clear(args).await,
            "grid_line"        => self.handle_grid_line(args).await,
            "grid_scroll"      => self.handle_grid_scroll(args).await,
            "grid_cursor_goto" => self.handle_grid_cursor_goto(args).await,
            "hl_attr_define"   => self.handle_hl_attr_define(args).await,
            "flush"            => debug!("Redraw flush"),
            _                  => debug!("Unhandled redraw event: {}", event_name),
        }
    }

    async fn handle_grid_resize(&self, args: &[Value]) {
        for params_val in args {
            if let Value::Array(params) = params_val {
                if params.len() >= 3 {
                    if let (Some(Value::Integer(_grid)), Some(Value::Integer(width)), Some(Value::Integer(height))) =
                        (params.get(0), params.get(1), params.get(2))
                    {
                        let width = width.as_u64().unwrap_or(80) as usize;
                        let height = height.as_u64().unwrap_or(24) as usize;
                        debug!("Grid resize: {}x{}", width, height);
                        let mut grid = self.grid.lock().await;
                        grid.resize(width, height);
                    }
                }
            }
        }
    }

    async fn handle_grid_clear(&self, _args: &[Value]) {
        debug!("Grid clear");
        let mut grid = self.grid.lock().await;
        grid.clear();
    }

    /// Handle `grid_scroll(grid, top, bot, left, right, rows, cols)`.
    ///
    /// This event is emitted whenever Neovim needs to shift a screen region —
    /// most importantly when a fold is closed or opened.  Without handling it,
    /// the stale content from the collapsed region remains in our grid, making
    /// closed folds appear to take up the same space as open ones.
    async fn handle_grid_scroll(&self, args: &[Value]) {
        for params in args {
            if let Value::Array(p) = params {
                if p.len() >= 6 {
                    let top   = p.get(1).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let bot   = p.get(2).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let left  = p.get(3).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let right = p.get(4).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    // rows is signed: positive = scroll up, negative = scroll down
                    let rows  = p.get(5).and_then(|v| v.as_i64()).unwrap_or(0);
                    debug!("grid_scroll top={top} bot={bot} rows={rows}");
                    let mut grid = self.grid.lock().await;
                    grid.scroll(top, bot, left, right, rows);
                }
            }
        }
    }

    async fn handle_grid_line(&self, args: &[Value]) {
        // A single `grid_line` event batch can carry updates for many rows at once.
        // Each element of `args` is one row-update: [grid, row, col_start, cells, wrap?].
        // Process every element — previously only `args.first()` was handled, which
        // caused all rows beyond the first to be silently dropped (the root cause of
        // folded body content never appearing in the rendered grid).
        for params_val in args {
            if let Value::Array(params) = params_val {
                if params.len() >= 4 {
                    let _grid_id = params.get(0).and_then(|v| v.as_u64());
                    let row = params.get(1).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let col_start = params.get(2).and_then(|v| v.as_u64()).unwrap_or(0) as usize;

                    if let Some(Value::Array(cells)) = params.get(3) {
                        let mut grid = self.grid.lock().await;
                        let mut col = col_start;
                        let mut current_attr = 0u64;

                        for cell_data in cells {
                            if let Value::Array(cell_parts) = cell_data {
                                // Cell format: [text, hl_id?, repeat?]
                                if let Some(Value::String(text)) = cell_parts.first() {
                                    let text_str = text.as_str().unwrap_or(" ");

                                    if let Some(Value::Integer(hl_id)) = cell_parts.get(1) {
                                        current_attr = hl_id.as_u64().unwrap_or(0);
                                    }

                                    let repeat = if let Some(Value::Integer(r)) = cell_parts.get(2) {
                                        r.as_u64().unwrap_or(1) as usize
                                    } else {
                                        1
                                    };

                                    for _ in 0..repeat {
                                        if col < grid.width {
                                            grid.set_cell(
                                                row,
                                                col,
                                                Cell {
                                                    text: text_str.to_string(),
                                                    attr_id: current_attr,
                                                },
                                            );
                                            col += 1;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_grid_cursor_goto(&self, args: &[Value]) {
        // Use the last cursor-goto in the batch as the definitive cursor position.
        for params_val in args {
            if let Value::Array(params) = params_val {
                if params.len() >= 3 {
                    if let (Some(Value::Integer(_grid)), Some(Value::Integer(row)), Some(Value::Integer(col))) =
                        (params.get(0), params.get(1), params.get(2))
                    {
                        let row = row.as_u64().unwrap_or(0) as u16;
                        let col = col.as_u64().unwrap_or(0) as u16;
                        let mut cursor = self.cursor_pos.lock().await;
                        *cursor = (row, col);
                    }
                }
            }
        }
    }

    async fn handle_hl_attr_define(&self, args: &[Value]) {
        // A single `hl_attr_define` batch can define many attributes at once.
        for params_val in args {
            if let Value::Array(params) = params_val {
                if params.len() >= 4 {
                    if let (Some(Value::Integer(id)), Some(Value::Map(rgb_attrs)), _, _) =
                        (params.get(0), params.get(1), params.get(2), params.get(3))
                    {
                        let attr_id = id.as_u64().unwrap_or(0);

                        let mut attr_map = HashMap::new();
                        for (key, value) in rgb_attrs {
                            if let Value::String(key_str) = key {
                                if let Some(key) = key_str.as_str() {
                                    attr_map.insert(key.to_string(), value.clone());
                                }
                            }
                        }

                        let hl_attr = HlAttr::from_map(&attr_map);

                        let mut attrs = self.hl_attrs.lock().await;
                        attrs.insert(attr_id, hl_attr);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Handler for NvimHandler {
    type Writer = Compat<ChildStdin>;

    async fn handle_request(
        &self,
        _name: String,
        _args: Vec<Value>,
        _neovim: Neovim<Self::Writer>,
    ) -> Result<Value, Value> {
        Ok(Value::from("ok"))
    }

    async fn handle_notify(
        &self,
        name: String,
        args: Vec<Value>,
        _neovim: Neovim<Self::Writer>,
    ) {
        if name == "redraw" {
            // Redraw notification contains an array of event batches
            for event_batch in args {
                if let Value::Array(events) = event_batch {
                    if let Some(Value::String(event_name)) = events.first() {
                        if let Some(event_name_str) = event_name.as_str() {
                            // Rest of the array contains arguments for this event
                            let event_args = &events[1..];
                            self.handle_redraw_event(event_name_str, event_args).await;
                        }
                    }
                }
            }
        }
    }
}

/// Render a grid snapshot to ratatui `Line`s, merging adjacent cells that
/// share the same highlight attribute into a single `Span`.
/// Exported as `pub(crate)` so unit tests can drive it without a live bridge.
pub(crate) fn render_grid_to_lines(
    grid: &Grid,
    attrs: &HashMap<u64, HlAttr>,
    scroll: usize,
    visible_height: usize,
) -> Vec<Line<'static>> {
    let start_row = scroll;
    let end_row = (start_row + visible_height).min(grid.height);
    let mut lines = Vec::new();

    for row in start_row..end_row {
        if row >= grid.cells.len() {
            break;
        }

        let mut spans: Vec<Span<'static>> = Vec::new();
        let mut current_text = String::new();
        let mut current_attr_id = 0u64;
        let mut current_style = Style::default();

        for cell in &grid.cells[row] {
            // Flush current span when the highlight attribute changes
            if cell.attr_id != current_attr_id && !current_text.is_empty() {
                spans.push(Span::styled(current_text.clone(), current_style));
                current_text.clear();
            }

            if cell.attr_id != current_attr_id {
                current_attr_id = cell.attr_id;
                current_style = attrs
                    .get(&current_attr_id)
                    .map(|a| a.to_style())
                    .unwrap_or_default();
            }

            current_text.push_str(&cell.text);
        }

        if !current_text.is_empty() {
            spans.push(Span::styled(current_text, current_style));
        }

        lines.push(Line::from(spans));
    }

    lines
}

/// Bridge to embedded Neovim instance
pub struct NvimBridge {
    pub(crate) neovim: Neovim<Compat<ChildStdin>>,
    _child: Child,
    grid: Arc<Mutex<Grid>>,
    hl_attrs: Arc<Mutex<HashMap<u64, HlAttr>>>,
    cursor_pos: Arc<Mutex<(u16, u16)>>,
    width: u16,
    height: u16,
    buffer: Buffer<Compat<ChildStdin>>,
}

impl NvimBridge {
    /// Spawn a new Neovim instance and attach as UI
    pub async fn spawn(width: u16, height: u16) -> Result<Self> {
        debug!("Spawning Neovim with dimensions {}x{}", width, height);
        
        // Create shared state for redraw handler
        let grid = Arc::new(Mutex::new(Grid::new(width as usize, height as usize)));
        let hl_attrs = Arc::new(Mutex::new(HashMap::new()));
        let cursor_pos = Arc::new(Mutex::new((0u16, 0u16)));

        let handler = NvimHandler::new(grid.clone(), hl_attrs.clone(), cursor_pos.clone());

        // Prepare command
        let mut cmd = Command::new("nvim");
        cmd.arg("--embed")
            .arg("--clean");  // Start with minimal config

        // Create Neovim RPC session
        let (neovim, _io_handle, child) = create::new_child_cmd(&mut cmd, handler)
            .await
            .context("Failed to create Neovim session")?;

        // Attach UI
        debug!("Attaching UI");
        let mut opts = UiAttachOptions::new();
        opts.set_linegrid_external(true)
            .set_rgb(true);
        
        neovim
            .ui_attach(width as i64, height as i64, &opts)
            .await
            .context("Failed to attach UI")?;

        // Create a new buffer for the conversation
        let buffer = neovim
            .create_buf(false, true)  // not listed, scratch
            .await
            .context("Failed to create buffer")?;

        // Set current buffer
        neovim
            .set_current_buf(&buffer)
            .await
            .context("Failed to set current buffer")?;

        debug!("NvimBridge initialized successfully");

        Ok(Self {
            neovim,
            _child: child,
            grid,
            hl_attrs,
            cursor_pos,
            width,
            height,
            buffer,
        })
    }

    /// Set the content of the conversation buffer
    pub async fn set_buffer_content(&mut self, content: &str) -> Result<()> {
        // Split into lines but preserve empty lines properly
        let lines: Vec<String> = if content.is_empty() {
            vec![]
        } else {
            content.split('\n').map(|s| s.to_string()).collect()
        };

        self.buffer
            .set_lines(0, -1, false, lines)
            .await
            .context("Failed to set buffer lines")?;

        // NOTE: No foldlevel manipulation needed here.
        // configure_buffer sets foldlevel=99, and when set_lines adds content,
        // Neovim evaluates the fold expression and creates folds OPEN because
        // foldlevel=99 >= any fold level we use.  Confirmed via foldclosed()
        // diagnostic: foldclosed(2)==-1 (open) immediately after set_lines.
        // Toggling foldlevel (0→99) would temporarily close the fold, causing
        // grid_scroll events that race with the subsequent re-open and leave
        // the grid in an incorrect state.

        Ok(())
    }

    /// Get the content of the conversation buffer
    #[allow(dead_code)]
    pub async fn get_buffer_content(&self) -> Result<String> {
        let lines = self.buffer
            .get_lines(0, -1, false)
            .await
            .context("Failed to get buffer lines")?;

        Ok(lines.join("\n"))
    }

    /// Send input keys to Neovim
    pub async fn send_input(&mut self, keys: &str) -> Result<()> {
        self.neovim
            .input(keys)
            .await
            .context("Failed to send input to Neovim")?;
        Ok(())
    }

    /// Resize the UI
    pub async fn resize(&mut self, width: u16, height: u16) -> Result<()> {
        self.width = width;
        self.height = height;
        
        self.neovim
            .ui_try_resize(width as i64, height as i64)
            .await
            .context("Failed to resize UI")?;

        Ok(())
    }

    /// Configure the buffer with markdown settings and fold configuration
    pub async fn configure_buffer(&mut self) -> Result<()> {
        // Set filetype to markdown (enables basic syntax highlighting)
        if let Err(e) = self.neovim.command("setlocal filetype=markdown").await {
            debug!("Could not set filetype: {:?}", e);
        }

        // Basic display settings (wrap/tab are window-scoped; use setlocal)
        let basic_settings = r#"
local buf = vim.api.nvim_get_current_buf()
vim.cmd('setlocal wrap')
vim.cmd('setlocal linebreak')
vim.bo[buf].expandtab = true
vim.bo[buf].tabstop = 2
vim.bo[buf].shiftwidth = 2
"#;
        
        if let Err(e) = self.neovim.exec_lua(basic_settings, vec![]).await {
            debug!("Could not set basic settings: {:?}", e);
        }

        // Fold configuration — fold settings are window-scoped, must use setlocal / vim.wo.
        //
        // Design decisions:
        //
        // 1. foldlevel=99 keeps all folds open by default.  The user can use
        //    zc/zo/za to open/close individual folds, zM to close all, zR to
        //    open all.
        //
        // 2. Body lines return "=" (inherit the level of the previous line).
        //    While Neovim docs note "=" requires a backward scan, the scan only
        //    reaches back to the nearest explicit fold marker (">1", ">2") which
        //    in a conversation log is at most a few tens of lines away.  The
        //    alternative — returning an explicit number — would break tool-section
        //    nesting: after a ">2" tool header, body lines at "2" are correctly
        //    inside the level-2 fold; returning a hard-coded "1" would exit that
        //    fold immediately.
        //
        // 3. foldminlines=0: allow even a fold with a single body line to be
        //    closed.  Without this, Neovim refuses to close very short tool
        //    sections.
        let fold_config = r#"
-- Fold expression for sven conversation structure.
function _G.sven_fold_expr(lnum)
  local ok, line = pcall(vim.fn.getline, lnum)
  if not ok then return '=' end

  -- Level-1 fold headers: user message separators and agent response lines
  if line:match('^%-%-%-$')         then return '>1' end
  if line:match('^%*%*Agent:%*%*')  then return '>1' end
  if line:match('^## ')             then return '>1' end

  -- Level-2 fold headers: tool call and response summary lines
  if line:match('^🔧 %*%*Tool Call:')     then return '>2' end
  if line:match('^✅ %*%*Tool Response:') then return '>2' end

  -- Body lines inherit the fold level of the previous line.
  -- The backward scan is bounded by the distance to the nearest fold marker,
  -- which is always short in practice.
  return '='
end

-- Window-scoped options must go through setlocal, not vim.bo
vim.cmd('setlocal foldmethod=expr')
vim.cmd('setlocal foldexpr=v:lua.sven_fold_expr(v:lnum)')
vim.cmd('setlocal foldlevel=99')   -- all folds open on load / buffer update
vim.cmd('setlocal foldenable')
vim.cmd('setlocal foldminlines=0') -- allow even 1-line-body folds to collapse

"#;

        if let Err(e) = self.neovim.exec_lua(fold_config, vec![]).await {
            debug!("Could not configure folding: {:?}", e);
            // Fall back: at least ensure content is visible with no automatic folding
            let _ = self.neovim.command("setlocal foldmethod=manual foldlevel=99").await;
        }

        debug!("Buffer configuration completed");
        Ok(())
    }

    /// Set whether the buffer is modifiable
    pub async fn set_modifiable(&mut self, modifiable: bool) -> Result<()> {
        let cmd = if modifiable {
            "setlocal modifiable"
        } else {
            "setlocal nomodifiable"
        };
        
        self.neovim
            .command(cmd)
            .await
            .context("Failed to set modifiable")?;

        Ok(())
    }

    /// Refresh todo display enhancements (virtual text, highlights)
    pub async fn refresh_todo_display(&mut self) -> Result<()> {
        self.neovim
            .exec_lua("pcall(_G.sven_enhance_todos)", vec![])
            .await
            .context("Failed to refresh todo display")?;

        Ok(())
    }

    /// Add custom keymaps for conversation navigation
    #[allow(dead_code)]
    pub async fn setup_custom_keymaps(&mut self) -> Result<()> {
        // This is called once during initialization
        // Additional custom keymaps can be added here
        
        // Example: Add a keymap to collapse all tool outputs
        self.neovim
            .command("nnoremap <buffer> <leader>ct :g/^> 🔧/normal zc<CR>")
            .await
            .ok();  // Don't fail if keymap doesn't work

        Ok(())
    }

    /// Set cursor position programmatically (useful for auto-scrolling)
    #[allow(dead_code)]
    pub async fn set_cursor(&mut self, row: i64, col: i64) -> Result<()> {
        self.neovim
            .call_function("nvim_win_set_cursor", vec![Value::from(0), Value::from(vec![Value::from(row), Value::from(col)])])
            .await
            .context("Failed to set cursor")?;

        Ok(())
    }

    /// Render the grid to ratatui Lines
    pub async fn render_to_lines(&self, scroll: u16, visible_height: u16) -> Vec<Line<'static>> {
        let grid = self.grid.lock().await;
        let attrs = self.hl_attrs.lock().await;
        render_grid_to_lines(&grid, &attrs, scroll as usize, visible_height as usize)
    }

    /// Get current cursor position
    pub async fn get_cursor_pos(&self) -> (u16, u16) {
        *self.cursor_pos.lock().await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
