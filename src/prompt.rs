//! Prompt construction for every oracle-backed stage.
//!
//! Each builder renders the question's schemas, a handful of worked
//! examples, and the open question, ending on the cue the stage's parser
//! expects (see [`crate::parse`]).

use chrono::NaiveDate;

use crate::models::{ColumnRef, DataSourceSchema, JoinEdge, Question, SchemaLink};

/// `Table t, columns = [*,a,b]` lines followed by the inferred foreign keys.
pub fn describe_sources(sources: &[DataSourceSchema]) -> String {
    let mut out = String::new();
    for source in sources {
        let columns: Vec<&str> = source.column_names().collect();
        out.push_str(&format!(
            "Table {}, columns = [*,{}]\n",
            source.table_name,
            columns.join(",")
        ));
    }
    let keys: Vec<String> = foreign_keys(sources)
        .iter()
        .map(|edge| edge.to_string())
        .collect();
    out.push_str(&format!("Foreign_keys = [{}]\n", keys.join(",")));
    out
}

/// Candidate join edges between distinct sources: every column name
/// (case-insensitive) that two tables share.
pub fn foreign_keys(sources: &[DataSourceSchema]) -> Vec<JoinEdge> {
    let mut edges = Vec::new();
    for (i, left) in sources.iter().enumerate() {
        for right in &sources[i + 1..] {
            if left.table_name.eq_ignore_ascii_case(&right.table_name) {
                continue;
            }
            for column in &left.columns {
                if let Some(other) = right.column(&column.name) {
                    edges.push(JoinEdge::new(
                        ColumnRef::new(&left.table_name, &column.name),
                        ColumnRef::new(&right.table_name, &other.name),
                    ));
                }
            }
        }
    }
    edges
}

const LINK_EXAMPLES: &str = r#"Table listing, columns = [*,listing_id,city,nightly_price,bedrooms]
Foreign_keys = []
Q: "Which listings in Lisbon cost less than 80 per night?"
A: Let's think step by step. In the question "Which listings in Lisbon cost less than 80 per night?", we are asked:
"Which listings" so we need column = [listing.listing_id]
"in Lisbon" so we need column = [listing.city]
"cost less than 80 per night" so we need column = [listing.nightly_price]
Based on the columns and tables, we need these Foreign_keys = [].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = [Lisbon,80]. So the Schema_links are:
Schema_links: [listing.listing_id,listing.city,listing.nightly_price,Lisbon,80]

Table author, columns = [*,author_id,name,country]
Table book, columns = [*,book_id,title,author_id,published_year]
Foreign_keys = [author.author_id = book.author_id]
Q: "List the titles of books written by authors from Chile."
A: Let's think step by step. In the question "List the titles of books written by authors from Chile.", we are asked:
"the titles of books" so we need column = [book.title]
"authors from Chile" so we need column = [author.country]
Based on the columns and tables, we need these Foreign_keys = [author.author_id = book.author_id].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = [Chile]. So the Schema_links are:
Schema_links: [book.title,author.author_id = book.author_id,author.country,Chile]

Table orders, columns = [*,order_id,customer_id,order_date,total]
Table customer, columns = [*,customer_id,name,segment]
Foreign_keys = [orders.customer_id = customer.customer_id]
Q: "How many orders were placed by each customer?"
A: Let's think step by step. In the question "How many orders were placed by each customer?", we are asked:
"How many orders" so we need column = [orders.*]
"each customer" so we need column = [customer.name]
Based on the columns and tables, we need these Foreign_keys = [orders.customer_id = customer.customer_id].
Based on the tables, columns, and Foreign_keys, The set of possible cell values are = []. So the Schema_links are:
Schema_links: [customer.name,orders.customer_id = customer.customer_id,orders.*]

"#;

/// Ask for the columns, join edges and cell values a question needs.
pub fn link_prompt(question: &Question) -> String {
    format!(
        "# Find the schema_links for generating SQL queries for each question based on the database schema and Foreign keys.\n\n\
         {examples}{schema}Q: \"{q}\"\n\
         A: Let's think step by step.",
        examples = LINK_EXAMPLES,
        schema = describe_sources(&question.data_sources),
        q = question.text,
    )
}

const AMBIGUITY_EXAMPLES: &str = r#"Table search_ads, columns = [*,date,search_impressions,search_clicks,search_spend]
Table social_ads, columns = [*,date,social_impressions,social_clicks,social_spend]
Foreign_keys = [search_ads.date = social_ads.date]

Q: "How much was spent on each date?"
A: Let's think step by step. In the question "How much was spent on each date?", we are asked:
"spent" which could be columns [search_spend] or [social_spend]
Ambiguities: By "spent" are you referring to [search_spend] or [social_spend] ?

Q: "What are the impressions and the clicks for each date?"
A: Let's think step by step. In the question "What are the impressions and the clicks for each date?", we are asked:
"the impressions" which could be columns [search_impressions] or [social_impressions]
"the clicks" which could be columns [search_clicks] or [social_clicks]
Ambiguities: By "the impressions" are you referring to [search_impressions] or [social_impressions] and by "the clicks" are you referring to [search_clicks] or [social_clicks] ?

Q: "What are the social clicks for each date?"
A: Let's think step by step. In the question "What are the social clicks for each date?", we are asked:
"social clicks" so we need column = [social_clicks]
Ambiguities: None

Q: "What are the bounces for each date?"
A: Let's think step by step. In the question "What are the bounces for each date?", we are asked:
"the bounces" which does not look like any of the columns
Ambiguities: Sorry I did not recognise the term "bounces", could you clarify what you mean by this?

"#;

/// Ask whether any term maps to several columns, or to none.
pub fn ambiguity_prompt(question: &Question) -> String {
    format!(
        "# Decide whether each term in the question maps to exactly one column of the tables below.\n\
         # A term is ambiguous when the same metric exists for several channels; a term is unrecognised when no column matches it.\n\n\
         {examples}{schema}\nQ: \"{q}\"\n\
         A: Let's think step by step.",
        examples = AMBIGUITY_EXAMPLES,
        schema = describe_sources(&question.data_sources),
        q = question.text,
    )
}

const CLASSIFICATION_EXAMPLES: &str = r#"Q: "Which listings in Lisbon cost less than 80 per night?"
schema_links: [listing.listing_id,listing.city,listing.nightly_price,Lisbon,80]
A: Let's think step by step. The SQL query for the question "Which listings in Lisbon cost less than 80 per night?" needs these tables = [listing], so we don't need JOIN.
Plus, it doesn't require nested queries with (INTERSECT, UNION, EXCEPT, IN, NOT IN), and we need the answer to the questions = [""].
So, we don't need JOIN and don't need nested queries, then the the SQL query can be classified as "EASY".
Label: "EASY"

Q: "List the titles of books written by authors from Chile."
schema_links: [book.title,author.author_id = book.author_id,author.country,Chile]
A: Let's think step by step. The SQL query for the question "List the titles of books written by authors from Chile." needs these tables = [author,book], so we need JOIN.
Plus, it doesn't need nested queries with (INTERSECT, UNION, EXCEPT, IN, NOT IN), and we need the answer to the questions = [""].
So, we need JOIN and don't need nested queries, then the the SQL query can be classified as "NON-NESTED".
Label: "NON-NESTED"

Q: "Which customers have never placed an order?"
schema_links: [customer.name,customer.customer_id,orders.customer_id]
A: Let's think step by step. The SQL query for the question "Which customers have never placed an order?" needs these tables = [customer,orders], so we don't need JOIN.
Plus, it requires nested queries with (INTERSECT, UNION, EXCEPT, IN, NOT IN), and we need the answer to the questions = ["Which customers have placed an order?"].
So, we don't need JOIN and need nested queries, then the the SQL query can be classified as "NESTED".
Label: "NESTED"

"#;

/// Ask for EASY / NON-NESTED / NESTED plus the sub-questions.
pub fn classification_prompt(question: &Question, link: &SchemaLink) -> String {
    format!(
        "# For the given question, classify it as EASY, NON-NESTED, or NESTED based on nested queries and JOIN.\n\
         if need nested queries: predict NESTED\n\
         elif need JOIN and don't need nested queries: predict NON-NESTED\n\
         elif don't need JOIN and don't need nested queries: predict EASY\n\n\
         {schema}\n{examples}Q: \"{q}\"\n\
         schema_links: {links}\n\
         A: Let's think step by step.",
        schema = describe_sources(&question.data_sources),
        examples = CLASSIFICATION_EXAMPLES,
        q = question.text,
        links = link.render(),
    )
}

const EASY_EXAMPLES: &str = r#"Q: "Which listings in Lisbon cost less than 80 per night?"
Schema_links: [listing.listing_id,listing.city,listing.nightly_price,Lisbon,80]
SQL: SELECT listing_id FROM listing WHERE city = 'Lisbon' AND nightly_price < 80

Q: "What is the average price of listings with three bedrooms?"
Schema_links: [listing.nightly_price,listing.bedrooms,3]
SQL: SELECT avg(nightly_price) FROM listing WHERE bedrooms = 3

Q: "Which city has the most listings?"
Schema_links: [listing.city]
SQL: SELECT city FROM listing GROUP BY city ORDER BY count(*) DESC LIMIT 1

"#;

/// Direct translation, no intermediate representation.
pub fn easy_prompt(question: &Question, link: &SchemaLink) -> String {
    format!(
        "# Use the schema links to generate the SQL queries for each of the questions.\n\
         {schema}\n{examples}Q: \"{q}\"\n\
         Schema_links: {links}\n\
         SQL: ",
        schema = describe_sources(&question.data_sources),
        examples = EASY_EXAMPLES,
        q = question.text,
        links = link.render(),
    )
}

const NON_NESTED_EXAMPLES: &str = r#"Q: "List the titles of books written by authors from Chile."
Schema_links: [book.title,author.author_id = book.author_id,author.country,Chile]
A: Let's think step by step. For creating the SQL for the given question, we need to join these tables = [author,book]. First, create an intermediate representation, then use it to construct the SQL query.
Intermediate_representation: select book.title from book  join author on author.author_id = book.author_id  where  author.country = "Chile"
SQL: SELECT T2.title FROM author AS T1 JOIN book AS T2 ON T1.author_id = T2.author_id WHERE T1.country = 'Chile'

Q: "How many orders were placed by each customer?"
Schema_links: [customer.name,orders.customer_id = customer.customer_id,orders.*]
A: Let's think step by step. For creating the SQL for the given question, we need to join these tables = [customer,orders]. First, create an intermediate representation, then use it to construct the SQL query.
Intermediate_representation: select customer.name , count ( orders.* ) from customer  join orders on orders.customer_id = customer.customer_id  group by customer.name
SQL: SELECT T1.name, count(*) FROM customer AS T1 JOIN orders AS T2 ON T2.customer_id = T1.customer_id GROUP BY T1.name

"#;

/// Synthesis through an intermediate representation, answered after `SQL: `.
pub fn non_nested_prompt(question: &Question, link: &SchemaLink) -> String {
    let tables: Vec<String> = link.tables().into_iter().collect();
    format!(
        "# Use the schema links and Intermediate_representation to generate the SQL queries for each of the questions.\n\
         {schema}\n{examples}Q: \"{q}\"\n\
         Schema_links: {links}\n\
         A: Let's think step by step. For creating the SQL for the given question, we need to join these tables = [{tables}]. \
         First, create an intermediate representation, then use it to construct the SQL query.\n\
         Intermediate_representation:",
        schema = describe_sources(&question.data_sources),
        examples = NON_NESTED_EXAMPLES,
        q = question.text,
        links = link.render(),
        tables = tables.join(","),
    )
}

const NESTED_EXAMPLES: &str = r#"Q: "Which customers have never placed an order?"
Schema_links: [customer.name,customer.customer_id,orders.customer_id]
A: Let's think step by step. "Which customers have never placed an order?" can be solved by knowing the answer to the following sub-question "Which customers have placed an order?".
The SQL query for the sub-question "Which customers have placed an order?" is SELECT customer_id FROM orders
So, the answer to the question "Which customers have never placed an order?" is =
Intermediate_representation: select customer.name from customer  where  @.@ not in orders.customer_id
SQL: SELECT name FROM customer WHERE customer_id NOT IN (SELECT customer_id FROM orders)

Q: "Which listings cost more than the average nightly price?"
Schema_links: [listing.listing_id,listing.nightly_price]
A: Let's think step by step. "Which listings cost more than the average nightly price?" can be solved by knowing the answer to the following sub-question "What is the average nightly price?".
The SQL query for the sub-question "What is the average nightly price?" is SELECT avg(nightly_price) FROM listing
So, the answer to the question "Which listings cost more than the average nightly price?" is =
Intermediate_representation: select listing.listing_id from listing  where  listing.nightly_price > avg ( listing.nightly_price )
SQL: SELECT listing_id FROM listing WHERE nightly_price > (SELECT avg(nightly_price) FROM listing)

"#;

/// Outer query built on already-solved sub-questions `(text, sql)`.
pub fn nested_prompt(
    question: &Question,
    link: &SchemaLink,
    solved: &[(String, String)],
) -> String {
    let mut reasoning = String::new();
    if solved.is_empty() {
        reasoning.push_str(&format!(
            "\"{}\" needs no separate sub-question.\n",
            question.text
        ));
    } else {
        let subs: Vec<String> = solved.iter().map(|(q, _)| format!("\"{}\"", q)).collect();
        reasoning.push_str(&format!(
            "\"{}\" can be solved by knowing the answer to the following sub-question {}.\n",
            question.text,
            subs.join(" and ")
        ));
        for (sub, sql) in solved {
            reasoning.push_str(&format!(
                "The SQL query for the sub-question \"{}\" is {}\n",
                sub, sql
            ));
        }
    }

    format!(
        "# Use the intermediate representation and the schema links to generate the SQL queries for each of the questions.\n\
         {schema}\n{examples}Q: \"{q}\"\n\
         Schema_links: {links}\n\
         A: Let's think step by step. {reasoning}\
         So, the answer to the question \"{q}\" is =\n\
         Intermediate_representation:",
        schema = describe_sources(&question.data_sources),
        examples = NESTED_EXAMPLES,
        q = question.text,
        links = link.render(),
        reasoning = reasoning,
    )
}

/// Ask for a corrected statement given the store's verbatim error.
pub fn repair_prompt(
    question: &Question,
    sql: &str,
    error: &str,
    dialect: &str,
    today: NaiveDate,
) -> String {
    format!(
        "You are an agent designed to fix {dialect} queries.\n\
         Today's date is {today}.\n\
         {schema}\n\
         Question: \"{q}\"\n\
         Failing SQL: {sql}\n\
         Database error: {error}\n\n\
         Rewrite the query so that it runs against the tables above and answers the question.\n\
         - If the query returns no rows, replace inner joins with LEFT JOIN.\n\
         - Write every date literal as YYYY-MM-DD.\n\
         - Only use the tables and columns listed above.\n\
         Answer with the corrected query on one line starting with \"SQL: \".\n",
        dialect = dialect,
        today = today.format("%Y-%m-%d"),
        schema = describe_sources(&question.data_sources),
        q = question.text,
        sql = sql,
        error = error,
    )
}

const UPDATE_EXAMPLES: &str = r#"Table search_ads, columns = [*,date,search_impressions,search_clicks,search_spend]
Table social_ads, columns = [*,date,social_impressions,social_clicks,social_spend]

Given the original question: "How much was spent on each date?"
And the AI's clarification question: By "spent" are you referring to [search_spend] or [social_spend] ?
To which the user responded: the search one
The updated question is: How much search_spend was there on each date?

Given the original question: "What are the impressions and the clicks for each date?"
And the AI's clarification question: By "the impressions" are you referring to [search_impressions] or [social_impressions] and by "the clicks" are you referring to [search_clicks] or [social_clicks] ?
To which the user responded: social impressions, and clicks from both
The updated question is: What are the social_impressions and the search_clicks and social_clicks for each date?

Given the original question: "What is the spend per click for each date?"
And the AI's clarification question: By "the spend" are you referring to [search_spend] or [social_spend] and by "per click" are you referring to [search_clicks] or [social_clicks] ?
To which the user responded: both
The updated question is: What is the search_spend per search_clicks and social_spend per social_clicks for each date?

Given the original question: "What are the bounces for each date?"
And the AI's clarification question: Sorry I did not recognise the term "bounces", could you clarify what you mean by this?
To which the user responded: I meant clicks on social
The updated question is: What are the social_clicks for each date?

"#;

/// Ask the oracle to fold a clarification answer into the question.
pub fn update_question_prompt(
    question: &Question,
    original: &str,
    clarification: &str,
    answer: &str,
) -> String {
    format!(
        "# Rewrite the original question so that it names the exact columns the user chose.\n\n\
         {examples}{schema}\n\
         Given the original question: \"{original}\"\n\
         And the AI's clarification question: {clarification}\n\
         To which the user responded: {answer}\n\
         The updated question is: ",
        examples = UPDATE_EXAMPLES,
        schema = describe_sources(&question.data_sources),
        original = original,
        clarification = clarification,
        answer = answer,
    )
}
