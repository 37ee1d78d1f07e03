//! SQL schema definitions

pub const SCHEMA: &str = r#"
-- Repositories table
CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    local_path TEXT,
    clone_status TEXT NOT NULL DEFAULT 'pending',
    description TEXT,
    language TEXT,
    size_kb INTEGER,
    file_count INTEGER,
    last_analyzed TEXT,
    complexity_summary TEXT,
    dependency_summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Workflow states table
CREATE TABLE IF NOT EXISTS workflow_states (
    id TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'initialized',
    current_agent TEXT,
    current_step TEXT,
    progress_percentage REAL NOT NULL DEFAULT 0.0,
    start_time TEXT NOT NULL,
    end_time TEXT,
    execution_time_seconds REAL,
    total_files_analyzed INTEGER NOT NULL DEFAULT 0,
    total_suggestions INTEGER NOT NULL DEFAULT 0,
    approved_suggestions INTEGER NOT NULL DEFAULT 0,
    agent_config TEXT,
    context_data TEXT,
    error_log TEXT,
    branch_name TEXT,
    pull_request_url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
);

-- Code analyses table
CREATE TABLE IF NOT EXISTS code_analyses (
    id TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL,
    workflow_state_id TEXT,
    file_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    language TEXT,
    lines_of_code INTEGER,
    complexity_score REAL,
    quality_score REAL,
    functions TEXT,
    classes TEXT,
    imports TEXT,
    comments TEXT,
    summary TEXT,
    issues_found TEXT,
    dependencies TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (repository_id, file_path),
    FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE,
    FOREIGN KEY (workflow_state_id) REFERENCES workflow_states(id) ON DELETE SET NULL
);

-- Suggestions table
CREATE TABLE IF NOT EXISTS suggestions (
    id TEXT PRIMARY KEY,
    analysis_id TEXT NOT NULL,
    suggestion_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'generated',
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    original_code TEXT,
    suggested_code TEXT,
    line_start INTEGER,
    line_end INTEGER,
    confidence_score REAL,
    impact_score REAL,
    agent_name TEXT,
    test_results TEXT,
    feedback TEXT,
    difficulty TEXT,
    estimated_minutes INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    reviewed_at TEXT,
    FOREIGN KEY (analysis_id) REFERENCES code_analyses(id) ON DELETE CASCADE
);

-- Agent interactions (append-only)
CREATE TABLE IF NOT EXISTS agent_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_state_id TEXT NOT NULL,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    interaction_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (workflow_state_id) REFERENCES workflow_states(id) ON DELETE CASCADE
);

-- Context snapshots (append-only)
CREATE TABLE IF NOT EXISTS context_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_state_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    context_type TEXT NOT NULL,
    context_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (workflow_state_id) REFERENCES workflow_states(id) ON DELETE CASCADE
);

-- Performance metrics (append-only)
CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_state_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    agent_name TEXT,
    duration_ms INTEGER NOT NULL,
    memory_mb REAL,
    api_calls INTEGER NOT NULL DEFAULT 0,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (workflow_state_id) REFERENCES workflow_states(id) ON DELETE CASCADE
);

-- Quality metrics (append-only)
CREATE TABLE IF NOT EXISTS quality_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    analysis_id TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_value REAL NOT NULL,
    category TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (analysis_id) REFERENCES code_analyses(id) ON DELETE CASCADE
);

-- Suggestion feedback (append-only)
CREATE TABLE IF NOT EXISTS suggestion_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    suggestion_id TEXT NOT NULL,
    decision TEXT NOT NULL,
    source TEXT NOT NULL,
    score REAL NOT NULL CHECK (score >= 0.0 AND score <= 1.0),
    reasoning TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (suggestion_id) REFERENCES suggestions(id) ON DELETE CASCADE
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_code_analyses_repository_id ON code_analyses(repository_id);
CREATE INDEX IF NOT EXISTS idx_code_analyses_workflow_state_id ON code_analyses(workflow_state_id);
CREATE INDEX IF NOT EXISTS idx_code_analyses_status ON code_analyses(status);
CREATE INDEX IF NOT EXISTS idx_suggestions_analysis_id ON suggestions(analysis_id);
CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions(status);
CREATE INDEX IF NOT EXISTS idx_workflow_states_repository_id ON workflow_states(repository_id);
CREATE INDEX IF NOT EXISTS idx_workflow_states_status ON workflow_states(status);
CREATE INDEX IF NOT EXISTS idx_agent_interactions_workflow ON agent_interactions(workflow_state_id, id);
CREATE INDEX IF NOT EXISTS idx_context_snapshots_workflow ON context_snapshots(workflow_state_id, id);
CREATE INDEX IF NOT EXISTS idx_performance_metrics_workflow ON performance_metrics(workflow_state_id, id);
CREATE INDEX IF NOT EXISTS idx_quality_metrics_analysis ON quality_metrics(analysis_id, id);
CREATE INDEX IF NOT EXISTS idx_suggestion_feedback_suggestion ON suggestion_feedback(suggestion_id, id);

-- At most one non-terminal workflow per repository
CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_states_one_active
    ON workflow_states(repository_id)
    WHERE status NOT IN ('completed', 'failed');

-- Repository summary
CREATE VIEW IF NOT EXISTS repository_summary AS
SELECT
    r.id AS repository_id,
    r.url,
    r.name,
    r.owner,
    r.clone_status,
    r.last_analyzed,
    (SELECT COUNT(DISTINCT ca.id) FROM code_analyses ca
        WHERE ca.repository_id = r.id) AS analyzed_files,
    (SELECT COUNT(DISTINCT s.id) FROM suggestions s
        JOIN code_analyses ca ON ca.id = s.analysis_id
        WHERE ca.repository_id = r.id) AS total_suggestions,
    (SELECT AVG(ca.complexity_score) FROM code_analyses ca
        WHERE ca.repository_id = r.id) AS avg_complexity,
    (SELECT AVG(ca.quality_score) FROM code_analyses ca
        WHERE ca.repository_id = r.id) AS avg_quality,
    (SELECT MAX(ca.created_at) FROM code_analyses ca
        WHERE ca.repository_id = r.id) AS last_analysis_at
FROM repositories r;

-- Workflow summary
CREATE VIEW IF NOT EXISTS workflow_summary AS
SELECT
    w.id AS workflow_state_id,
    w.workflow_id,
    w.repository_id,
    r.name AS repository_name,
    r.owner AS repository_owner,
    r.url AS repository_url,
    w.status,
    CASE w.status
        WHEN 'completed' THEN 'success'
        WHEN 'failed' THEN 'failed'
        ELSE 'running'
    END AS execution_status,
    w.current_agent,
    w.current_step,
    w.progress_percentage,
    w.start_time,
    w.end_time,
    w.execution_time_seconds,
    w.total_files_analyzed,
    w.total_suggestions,
    w.approved_suggestions,
    (SELECT COUNT(*) FROM code_analyses ca
        WHERE ca.workflow_state_id = w.id AND ca.status = 'completed') AS derived_files_analyzed,
    (SELECT COUNT(*) FROM suggestions s
        JOIN code_analyses ca ON ca.id = s.analysis_id
        WHERE ca.workflow_state_id = w.id) AS derived_suggestions,
    (SELECT COUNT(*) FROM suggestions s
        JOIN code_analyses ca ON ca.id = s.analysis_id
        WHERE ca.workflow_state_id = w.id
          AND s.status IN ('approved', 'applied')) AS derived_approved,
    w.branch_name,
    w.pull_request_url
FROM workflow_states w
JOIN repositories r ON r.id = w.repository_id;

-- Suggestion summary
CREATE VIEW IF NOT EXISTS suggestion_summary AS
SELECT
    s.id AS suggestion_id,
    s.suggestion_type,
    s.status,
    s.title,
    s.confidence_score,
    s.impact_score,
    s.agent_name,
    s.created_at,
    ca.id AS analysis_id,
    ca.file_path,
    r.id AS repository_id,
    r.name AS repository_name,
    r.owner AS repository_owner,
    r.url AS repository_url
FROM suggestions s
JOIN code_analyses ca ON ca.id = s.analysis_id
JOIN repositories r ON r.id = ca.repository_id;
"#;
